//! The inode directory log.
//!
//! A chain of inode blocks, linked like file chains, holding one record per
//! data slot. Records are only ever appended: a file is created by appending
//! its record and deleted by appending a tombstone with the same file id.

use alloc::string::String;

use crate::allocator::{write_link, BlockAllocator, Claimed};
use crate::config::*;
use crate::directory::{DirEntry, Directory};
use crate::flash::{Flash, FlashDevice};
use crate::structs::{validate_name, BlockType, InodeRecord, Spare, SpareKind};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct InodeLog {
    head: u32,
    tail: u32,
    tail_sequence: u32,
    /// Next free slot in the tail block, `None` when it is full.
    next_slot: Option<u32>,
    /// The tail already links to a block that is not part of the log.
    sealed: bool,
    next_file_id: u32,
    clock: u32,
}

impl InodeLog {
    /// Claims the first inode block on a freshly formatted device.
    pub(crate) fn create_head<D: FlashDevice>(flash: &mut Flash<D>, alloc: &mut BlockAllocator) -> Result<Self> {
        let head = alloc.claim_block(flash, BlockType::INode, 0)?;
        Ok(Self::resume(head.block, head.block, 0, Some(FIRST_DATA_SLOT), 0, 0))
    }

    /// Continues a log found by the mount scan.
    pub(crate) fn resume(
        head: u32,
        tail: u32,
        tail_sequence: u32,
        next_slot: Option<u32>,
        highest_file_id: u32,
        latest_time: u32,
    ) -> Self {
        Self {
            head,
            tail,
            tail_sequence,
            next_slot,
            sealed: false,
            next_file_id: highest_file_id + 1,
            clock: latest_time,
        }
    }

    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    pub fn next_file_id(&self) -> u32 {
        self.next_file_id
    }

    /// Logical time: never decreases, no wall clock involved.
    pub fn now(&self) -> u32 {
        self.clock
    }

    fn tick(&mut self) -> u32 {
        self.clock += 1;
        self.clock
    }

    /// Claims the next inode block and links the tail to it.
    fn extend<D: FlashDevice>(&mut self, flash: &mut Flash<D>, alloc: &mut BlockAllocator) -> Result<()> {
        let next: Claimed = alloc.claim_block(flash, BlockType::INode, self.tail_sequence + 1)?;
        if let Err(e) = write_link(flash, self.tail, next) {
            alloc.add_reclaimable(next.block);
            if let Error::DeviceFailure { .. } = e {
                alloc.retire(flash, self.tail)?;
            }
            return Err(e);
        }
        self.tail = next.block;
        self.tail_sequence += 1;
        self.next_slot = Some(FIRST_DATA_SLOT);
        Ok(())
    }

    /// Appends a record, extending the log with a new block when the tail is full.
    ///
    /// A tail that fails to program is retired and the record goes to a fresh block.
    pub(crate) fn append<D: FlashDevice>(
        &mut self,
        flash: &mut Flash<D>,
        alloc: &mut BlockAllocator,
        record: &InodeRecord,
    ) -> Result<()> {
        if self.sealed {
            return Err(Error::CorruptMetadata { block: self.tail });
        }
        let spare = Spare::new(SpareKind::INodeEntry, INODE_RECORD_SIZE as u16, record.file_id);
        let encoded = record.encode();
        loop {
            let slot = match self.next_slot {
                Some(slot) => slot,
                None => {
                    self.extend(flash, alloc)?;
                    FIRST_DATA_SLOT
                }
            };
            match flash.program_slot(self.tail, slot, 0, &encoded, Some(&spare)) {
                Ok(()) => {
                    log::debug!(
                        "inode record {} {:?} (deleted: {}) at {}/{}",
                        record.file_id,
                        record.name,
                        record.deleted,
                        self.tail,
                        slot
                    );
                    self.next_slot = if slot < flash.geometry().last_data_slot() {
                        Some(slot + 1)
                    } else {
                        None
                    };
                    return Ok(());
                }
                Err(Error::DeviceFailure { .. }) => {
                    flash.warn(format_args!("inode block {} failed to program, extending the log", self.tail));
                    alloc.retire(flash, self.tail)?;
                    self.next_slot = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a file: claims its first block, then appends its record.
    pub(crate) fn create<D: FlashDevice>(
        &mut self,
        flash: &mut Flash<D>,
        alloc: &mut BlockAllocator,
        directory: &mut Directory,
        name: &str,
    ) -> Result<DirEntry> {
        validate_name(name)?;
        if directory.contains(name) {
            return Err(Error::AlreadyExists);
        }

        let file_id = self.next_file_id;
        let first = alloc.claim_block(flash, BlockType::File, file_id)?;
        self.next_file_id += 1;

        let record = InodeRecord {
            file_id,
            created_at: self.tick(),
            deleted_at: TIMESTAMP_NONE,
            first_block: first.block,
            last_block: first.block,
            deleted: false,
            name: String::from(name),
        };
        if let Err(e) = self.append(flash, alloc, &record) {
            alloc.add_reclaimable(first.block);
            return Err(e);
        }

        let entry = DirEntry::from_record(&record);
        directory.insert(entry.clone());
        Ok(entry)
    }

    /// Appends a tombstone for the active file called `name`.
    ///
    /// The file's blocks stay on flash; the caller decides about reclaiming them.
    pub(crate) fn delete<D: FlashDevice>(
        &mut self,
        flash: &mut Flash<D>,
        alloc: &mut BlockAllocator,
        directory: &mut Directory,
        name: &str,
    ) -> Result<DirEntry> {
        let entry = lookup(directory, name)?.clone();
        let record = InodeRecord {
            file_id: entry.file_id,
            created_at: entry.created_at,
            deleted_at: self.tick(),
            first_block: entry.first_block,
            last_block: entry.last_block,
            deleted: true,
            name: entry.name.clone(),
        };
        self.append(flash, alloc, &record)?;
        directory.remove(name);
        Ok(entry)
    }
}

/// The active record for `name`.
pub(crate) fn lookup<'d>(directory: &'d Directory, name: &str) -> Result<&'d DirEntry> {
    directory.lookup(name).ok_or(Error::NotFound)
}
