//! Addressing math for the fixed block / page / sector layout.
//!
//! Every page stores `sectors_per_page` data sectors back to back, followed by
//! its spare table: one `SPARE_RECORD_SIZE` record per data sector.
//! Inside a block, sectors are also addressed by a linear slot number
//! `page * sectors_per_page + sector`. Slot 0 carries the block header and the
//! last slot carries the forward link, the rest hold data.

use crate::config::*;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub number_of_blocks: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub sector_size: u32,
}

/// Position of a sector inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorAddr {
    pub page: u32,
    pub sector: u32,
}

impl Geometry {
    pub fn new(
        number_of_blocks: u32,
        pages_per_block: u32,
        sectors_per_page: u32,
        sector_size: u32,
    ) -> Result<Self> {
        let geometry = Self {
            number_of_blocks,
            pages_per_block,
            sectors_per_page,
            sector_size,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// A block needs a header slot, a link slot and at least one data slot,
    /// and a sector must hold the largest record we store in it.
    pub fn validate(&self) -> Result<()> {
        if self.number_of_blocks < 2 || self.pages_per_block == 0 || self.sectors_per_page == 0 {
            return Err(Error::InvalidGeometry);
        }
        if self.slots_per_block() < 3 {
            return Err(Error::InvalidGeometry);
        }
        let min_sector = INODE_RECORD_SIZE.max(AGE_STAMP_SIZE).max(LINK_RECORD_SIZE);
        if (self.sector_size as usize) < min_sector || self.sector_size > u16::MAX as u32 {
            return Err(Error::InvalidGeometry);
        }
        Ok(())
    }

    pub fn slots_per_block(&self) -> u32 {
        self.pages_per_block * self.sectors_per_page
    }

    pub fn link_slot(&self) -> u32 {
        self.slots_per_block() - 1
    }

    pub fn last_data_slot(&self) -> u32 {
        self.link_slot() - 1
    }

    pub fn data_slots_per_block(&self) -> u32 {
        self.slots_per_block() - 2
    }

    /// Payload capacity of a completely filled file block.
    pub fn data_bytes_per_block(&self) -> u64 {
        self.data_slots_per_block() as u64 * self.sector_size as u64
    }

    pub fn slot_addr(&self, slot: u32) -> SectorAddr {
        debug_assert!(slot < self.slots_per_block());
        SectorAddr {
            page: slot / self.sectors_per_page,
            sector: slot % self.sectors_per_page,
        }
    }

    pub fn slot_of(&self, addr: SectorAddr) -> u32 {
        addr.page * self.sectors_per_page + addr.sector
    }

    pub fn spare_table_size(&self) -> u32 {
        self.sectors_per_page * SPARE_RECORD_SIZE as u32
    }

    /// Physical size of a page, data sectors plus spare table.
    pub fn page_size(&self) -> u32 {
        self.sectors_per_page * self.sector_size + self.spare_table_size()
    }

    pub fn block_size(&self) -> u64 {
        self.pages_per_block as u64 * self.page_size() as u64
    }

    pub fn device_size(&self) -> u64 {
        self.number_of_blocks as u64 * self.block_size()
    }

    pub fn page_offset(&self, block: u32, page: u32) -> u64 {
        debug_assert!(block < self.number_of_blocks && page < self.pages_per_block);
        block as u64 * self.block_size() + page as u64 * self.page_size() as u64
    }

    /// Absolute device offset of a byte inside a data sector.
    pub fn sector_offset(&self, block: u32, page: u32, sector: u32, offset: u32) -> u64 {
        debug_assert!(sector < self.sectors_per_page && offset <= self.sector_size);
        self.page_offset(block, page) + (sector * self.sector_size + offset) as u64
    }

    /// Absolute device offset of the spare table of a page.
    pub fn spare_table_offset(&self, block: u32, page: u32) -> u64 {
        self.page_offset(block, page) + (self.sectors_per_page * self.sector_size) as u64
    }

    /// Absolute device offset of the spare record belonging to `sector`.
    pub fn spare_offset(&self, block: u32, page: u32, sector: u32) -> u64 {
        debug_assert!(sector < self.sectors_per_page);
        self.spare_table_offset(block, page) + (sector as usize * SPARE_RECORD_SIZE) as u64
    }

    /// Bytes a file can hold if every block but the inode log head carries data.
    pub fn theoretical_capacity(&self) -> u64 {
        (self.number_of_blocks as u64 - 1) * self.data_bytes_per_block()
    }
}
