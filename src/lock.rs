//! Whole-filesystem mutual exclusion for callers in several execution contexts.
//!
//! `FlogFs` itself takes `&mut self` everywhere; this wrapper only makes sure
//! a single logical operation is in flight at a time.

use parking_lot::{Mutex, MutexGuard};

use crate::{FlashDevice, FlogFs};

pub struct SharedFlogFs<D: FlashDevice> {
    inner: Mutex<FlogFs<D>>,
}

impl<D: FlashDevice> SharedFlogFs<D> {
    pub fn new(fs: FlogFs<D>) -> Self {
        Self { inner: Mutex::new(fs) }
    }

    /// Blocks until no other operation is running.
    pub fn lock(&self) -> MutexGuard<'_, FlogFs<D>> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, FlogFs<D>>> {
        self.inner.try_lock()
    }

    /// Runs `f` with exclusive access to the filesystem.
    pub fn with<R>(&self, f: impl FnOnce(&mut FlogFs<D>) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn into_inner(self) -> FlogFs<D> {
        self.inner.into_inner()
    }
}
