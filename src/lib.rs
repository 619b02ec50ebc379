//! Flogfs is a log-structured file system for raw NAND/SPI flash on small devices
//! that append log data and must survive losing power mid-write.
//! No directories, permissions or random writes: files are created, appended to,
//! read sequentially (with seeking) and removed.
//!
//! Flogfs's on-flash layout, per block:
//! - Header slot: age stamp (erase count) and claim record (inode or file block)
//! - Data slots: inode records or file payload, one spare record each
//! - Link slot: forward pointer to the next block of the same chain
//!
//! Flogfs's layers (from bottom to top):
//! 1. Flash Device: raw page/sector/spare access.         | User implemented (hardware-specific)
//! 2. Geometry/Structs: addressing math and record codecs. | Fs implemented
//! 3. Allocator: erased block pool, random pick.           | Fs implemented
//! 4. Walk: read-only scan that rebuilds all state.        | Fs implemented
//! 5. Inode log / File chains: append-only metadata, data. | Fs implemented
//! 6. FlogFs: the main interface, optionally behind `SharedFlogFs`.
//!
//! Nothing but the flash itself is persisted. Mounting walks every block and
//! rebuilds the free pool, the directory and each file's size.

// Users of this crate must enable the `alloc` feature for heap allocations.
extern crate alloc;

mod allocator;
mod config;
mod directory;
mod error;
mod file;
mod flash;
mod fs;
mod geometry;
mod inode;
mod lock;
mod structs;
mod walk;

pub use config::*;
pub use directory::{DirEntry, Directory, Listing};
pub use error::FsError as Error;
pub use error::Result;
pub use file::{ReadHandle, WriteHandle};
pub use flash::{FlashDevice, FlashEvent};
pub use fs::{CheckReport, FlogFs};
pub use geometry::{Geometry, SectorAddr};
pub use inode::InodeLog;
pub use lock::SharedFlogFs;
pub use structs::*;
pub use walk::{Analysis, BlockFault, BlockKind, BlockRecord, FileSector, InodeSector, InodeSlot, Walk};
