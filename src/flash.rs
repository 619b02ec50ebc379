//! The flash capability consumed by the core, and the page cursor wrapped around it.

use core::fmt;

use alloc::vec;

use crate::config::*;
use crate::structs::{Spare, SpareState};
use crate::{Error, Geometry, Result};

/// Coarse lifecycle notifications a backend may use for instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    PrimeBegin,
    PrimeEnd,
    FormatBegin,
    FormatEnd,
}

/// Raw access to NAND/SPI flash, implemented by a backend.
///
/// Sector reads and writes address the page selected by the last
/// `open_page` call. `sector` is the index of the data sector inside that
/// page, `offset` a byte offset inside the sector.
pub trait FlashDevice: Send {
    fn initialize(&mut self, geometry: &Geometry) -> Result<()>;

    /// Selects the page subsequent sector operations apply to.
    fn open_page(&mut self, block: u32, page: u32) -> Result<()>;

    fn close_page(&mut self) {}

    /// Sets every byte of the block, data and spare, to the erased state.
    fn erase_block(&mut self, block: u32) -> Result<()>;

    fn is_bad_block(&mut self, block: u32) -> Result<bool>;

    fn mark_bad_block(&mut self, block: u32) -> Result<()>;

    /// Acknowledges a program operation on hardware that needs it.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_sector(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()>;

    fn read_spare(&mut self, sector: u32, buf: &mut [u8; SPARE_RECORD_SIZE]) -> Result<()>;

    fn write_sector(&mut self, sector: u32, offset: u32, data: &[u8]) -> Result<()>;

    fn write_spare(&mut self, sector: u32, data: &[u8; SPARE_RECORD_SIZE]) -> Result<()>;

    /// Uniformly distributed value in `[0, max)`.
    fn random(&mut self, max: u32) -> u32;

    fn event(&mut self, _event: FlashEvent) {}

    fn warn(&self, args: fmt::Arguments<'_>) {
        log::warn!("{}", args);
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        log::error!("{}", args);
    }
}

impl<T: FlashDevice + ?Sized> FlashDevice for alloc::boxed::Box<T> {
    fn initialize(&mut self, geometry: &Geometry) -> Result<()> {
        (**self).initialize(geometry)
    }

    fn open_page(&mut self, block: u32, page: u32) -> Result<()> {
        (**self).open_page(block, page)
    }

    fn close_page(&mut self) {
        (**self).close_page()
    }

    fn erase_block(&mut self, block: u32) -> Result<()> {
        (**self).erase_block(block)
    }

    fn is_bad_block(&mut self, block: u32) -> Result<bool> {
        (**self).is_bad_block(block)
    }

    fn mark_bad_block(&mut self, block: u32) -> Result<()> {
        (**self).mark_bad_block(block)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn read_sector(&mut self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read_sector(sector, offset, buf)
    }

    fn read_spare(&mut self, sector: u32, buf: &mut [u8; SPARE_RECORD_SIZE]) -> Result<()> {
        (**self).read_spare(sector, buf)
    }

    fn write_sector(&mut self, sector: u32, offset: u32, data: &[u8]) -> Result<()> {
        (**self).write_sector(sector, offset, data)
    }

    fn write_spare(&mut self, sector: u32, data: &[u8; SPARE_RECORD_SIZE]) -> Result<()> {
        (**self).write_spare(sector, data)
    }

    fn random(&mut self, max: u32) -> u32 {
        (**self).random(max)
    }

    fn event(&mut self, event: FlashEvent) {
        (**self).event(event)
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        (**self).warn(args)
    }

    fn error(&self, args: fmt::Arguments<'_>) {
        (**self).error(args)
    }
}

/// Owns the device and the single "currently open page" cursor.
///
/// Every program operation goes through `program_slot`, which refuses to
/// touch bytes that are not erased.
pub(crate) struct Flash<D: FlashDevice> {
    device: D,
    geometry: Geometry,
    open: Option<(u32, u32)>,
}

impl<D: FlashDevice> Flash<D> {
    pub fn new(device: D, geometry: Geometry) -> Self {
        Self {
            device,
            geometry,
            open: None,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.close();
        &mut self.device
    }

    pub fn into_inner(mut self) -> D {
        self.close();
        self.device
    }

    pub fn open(&mut self, block: u32, page: u32) -> Result<()> {
        if self.open == Some((block, page)) {
            return Ok(());
        }
        self.close();
        log::trace!("open page {}/{}", block, page);
        self.device.open_page(block, page)?;
        self.open = Some((block, page));
        Ok(())
    }

    pub fn close(&mut self) {
        if self.open.take().is_some() {
            self.device.close_page();
        }
    }

    pub fn read_slot(&mut self, block: u32, slot: u32, offset: u32, buf: &mut [u8]) -> Result<()> {
        let addr = self.geometry.slot_addr(slot);
        self.open(block, addr.page)?;
        self.device.read_sector(addr.sector, offset, buf)
    }

    pub fn read_spare(&mut self, block: u32, slot: u32) -> Result<SpareState> {
        let addr = self.geometry.slot_addr(slot);
        self.open(block, addr.page)?;
        let mut buf = [0u8; SPARE_RECORD_SIZE];
        self.device.read_spare(addr.sector, &mut buf)?;
        Ok(Spare::decode(&buf))
    }

    /// True when every data byte of the slot still reads erased.
    pub fn slot_is_erased(&mut self, block: u32, slot: u32) -> Result<bool> {
        let mut buf = vec![0u8; self.geometry.sector_size as usize];
        self.read_slot(block, slot, 0, &mut buf)?;
        Ok(buf.iter().all(|&b| b == ERASED_BYTE))
    }

    /// Programs `data` at `offset` of a slot, then its spare record if given.
    pub fn program_slot(
        &mut self,
        block: u32,
        slot: u32,
        offset: u32,
        data: &[u8],
        spare: Option<&Spare>,
    ) -> Result<()> {
        let addr = self.geometry.slot_addr(slot);
        self.open(block, addr.page)?;

        let mut current = vec![0u8; data.len()];
        self.device.read_sector(addr.sector, offset, &mut current)?;
        let mut spare_current = [ERASED_BYTE; SPARE_RECORD_SIZE];
        if spare.is_some() {
            self.device.read_spare(addr.sector, &mut spare_current)?;
        }
        let erased = current.iter().chain(spare_current.iter()).all(|&b| b == ERASED_BYTE);
        if !erased {
            self.device.error(format_args!(
                "write to un-erased memory: block {} page {} sector {} offset {} size {}",
                block,
                addr.page,
                addr.sector,
                offset,
                data.len()
            ));
            return Err(Error::InvariantViolation {
                block,
                page: addr.page,
                sector: addr.sector,
            });
        }

        log::trace!("program {}/{}/{} +{} ({} bytes)", block, addr.page, addr.sector, offset, data.len());
        if !data.is_empty() {
            self.device.write_sector(addr.sector, offset, data)?;
        }
        if let Some(spare) = spare {
            self.device.write_spare(addr.sector, &spare.encode())?;
        }
        self.device.commit()
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        self.close();
        log::trace!("erase block {}", block);
        self.device.erase_block(block)
    }

    pub fn is_bad(&mut self, block: u32) -> Result<bool> {
        self.close();
        self.device.is_bad_block(block)
    }

    pub fn mark_bad(&mut self, block: u32) -> Result<()> {
        self.close();
        self.device.warn(format_args!("marking block {} bad", block));
        self.device.mark_bad_block(block)
    }

    pub fn random(&mut self, max: u32) -> u32 {
        self.device.random(max)
    }

    pub fn event(&mut self, event: FlashEvent) {
        self.device.event(event);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.device.warn(args);
    }
}
