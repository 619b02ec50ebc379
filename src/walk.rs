//! Read-only traversal of every block on the device.
//!
//! Each block describes itself: the header slot carries its age stamp and
//! claim record, data slots carry spare records, the last slot carries the
//! forward link. `Walk` yields one `BlockRecord` per block in device order
//! and is the only way state is rebuilt after a restart. Mount, listing,
//! self-check and external tooling all consume it.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::allocator::{read_age_stamp, read_link};
use crate::config::*;
use crate::flash::{Flash, FlashDevice};
use crate::structs::{AgeStampState, BlockType, InodeRecord, SpareKind, SpareState};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockFault {
    /// Reported bad by the device and holding nothing claimed.
    Bad,
    /// The device failed to read the block.
    Unreadable,
    /// Header stamp or claim record did not decode.
    CorruptHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Unallocated,
    INode,
    File,
    Error(BlockFault),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeSlot {
    Valid(InodeRecord),
    Garbage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeSector {
    pub slot: u32,
    pub entry: InodeSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSector {
    pub slot: u32,
    pub valid: bool,
    /// Programmed without a valid spare record: power was lost mid-program.
    /// Holds no file bytes and is skipped.
    pub torn: bool,
    pub size: u16,
}

/// Everything the walk learned about one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub block: u32,
    pub kind: BlockKind,
    /// Reported bad by the device. Claimed blocks keep their contents.
    pub bad: bool,
    /// Erase count from the age stamp, `None` if the block was never stamped.
    pub age: Option<u32>,
    /// File id for file blocks, position in the log for inode blocks.
    pub owner: u32,
    pub next_block: Option<u32>,
    /// The link slot holds something that is not a link.
    pub broken_link: bool,
    pub bytes_in_block: u32,
    /// First data slot after the last programmed one, `None` when full.
    pub append_slot: Option<u32>,
    /// Programmed inode slots, inode blocks only.
    pub inodes: Vec<InodeSector>,
    /// Programmed data slots, file blocks only.
    pub sectors: Vec<FileSector>,
}

impl BlockRecord {
    fn new(block: u32, kind: BlockKind) -> Self {
        Self {
            block,
            kind,
            bad: false,
            age: None,
            owner: 0,
            next_block: None,
            broken_link: false,
            bytes_in_block: 0,
            append_slot: None,
            inodes: Vec::new(),
            sectors: Vec::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == BlockKind::File
    }

    pub fn is_inode(&self) -> bool {
        self.kind == BlockKind::INode
    }

    pub fn has_more(&self) -> bool {
        self.next_block.is_some()
    }

    /// Inode records that are valid and not tombstones.
    pub fn file_entries(&self) -> impl Iterator<Item = &InodeRecord> {
        self.inodes.iter().filter_map(|s| match &s.entry {
            InodeSlot::Valid(record) if !record.deleted => Some(record),
            _ => None,
        })
    }
}

/// Reads and classifies a single block.
///
/// A bad block that still decodes as claimed is reported with its contents,
/// since it went bad while holding data of a file or of the inode log.
pub(crate) fn scan_block<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> BlockRecord {
    let bad = match flash.is_bad(block) {
        Ok(bad) => bad,
        Err(_) => return BlockRecord::new(block, BlockKind::Error(BlockFault::Unreadable)),
    };
    if bad {
        let mut record = match try_scan_block(flash, block) {
            Ok(record) if record.is_file() || record.is_inode() => record,
            _ => BlockRecord::new(block, BlockKind::Error(BlockFault::Bad)),
        };
        record.bad = true;
        return record;
    }
    match try_scan_block(flash, block) {
        Ok(record) => record,
        Err(Error::CorruptMetadata { .. }) => {
            flash.warn(format_args!("block {} has a corrupt header", block));
            BlockRecord::new(block, BlockKind::Error(BlockFault::CorruptHeader))
        }
        Err(e) => {
            flash.warn(format_args!("block {} unreadable: {}", block, e));
            BlockRecord::new(block, BlockKind::Error(BlockFault::Unreadable))
        }
    }
}

fn try_scan_block<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> Result<BlockRecord> {
    let stamp = read_age_stamp(flash, block)?;
    let claim = flash.read_spare(block, HEADER_SLOT)?;

    let age = match stamp {
        AgeStampState::Stamped(stamp) => Some(stamp.age),
        AgeStampState::Erased => None,
        AgeStampState::Garbage => return Err(Error::CorruptMetadata { block }),
    };

    let (block_type, owner) = match claim {
        SpareState::Erased => {
            let mut record = BlockRecord::new(block, BlockKind::Unallocated);
            record.age = age;
            return Ok(record);
        }
        SpareState::Valid(spare) => match spare.kind.claimed_type() {
            Some(block_type) => (block_type, spare.owner),
            None => return Err(Error::CorruptMetadata { block }),
        },
        SpareState::Garbage => return Err(Error::CorruptMetadata { block }),
    };

    let kind = match block_type {
        BlockType::INode => BlockKind::INode,
        BlockType::File => BlockKind::File,
    };
    let mut record = BlockRecord::new(block, kind);
    record.age = age;
    record.owner = owner;

    let last_data_slot = flash.geometry().last_data_slot();
    let sector_size = flash.geometry().sector_size;
    let mut last_programmed = None;

    for slot in FIRST_DATA_SLOT..=last_data_slot {
        let spare = flash.read_spare(block, slot)?;
        let torn = match spare {
            SpareState::Erased if flash.slot_is_erased(block, slot)? => continue,
            SpareState::Erased | SpareState::Garbage => true,
            SpareState::Valid(_) => false,
        };
        last_programmed = Some(slot);
        if torn {
            flash.warn(format_args!("torn program at {}/{}", block, slot));
        }

        match block_type {
            BlockType::INode => {
                let entry = match spare {
                    SpareState::Valid(s) if s.kind == SpareKind::INodeEntry => {
                        let mut buf = [0u8; INODE_RECORD_SIZE];
                        flash.read_slot(block, slot, 0, &mut buf)?;
                        match InodeRecord::decode(&buf) {
                            Some(inode) if inode.file_id == s.owner => InodeSlot::Valid(inode),
                            _ => InodeSlot::Garbage,
                        }
                    }
                    _ => InodeSlot::Garbage,
                };
                if entry == InodeSlot::Garbage && !torn {
                    flash.warn(format_args!("garbage inode record at {}/{}", block, slot));
                }
                record.inodes.push(InodeSector { slot, entry });
            }
            BlockType::File => {
                let sector = match spare {
                    SpareState::Valid(s)
                        if s.kind == SpareKind::FileData && s.owner == owner && s.length as u32 <= sector_size =>
                    {
                        FileSector {
                            slot,
                            valid: true,
                            torn: false,
                            size: s.length,
                        }
                    }
                    _ => FileSector {
                        slot,
                        valid: false,
                        torn,
                        size: 0,
                    },
                };
                record.bytes_in_block += sector.size as u32;
                record.sectors.push(sector);
            }
        }
    }

    record.append_slot = match last_programmed {
        None => Some(FIRST_DATA_SLOT),
        Some(slot) if slot < last_data_slot => Some(slot + 1),
        Some(_) => None,
    };

    match read_link(flash, block) {
        Ok(link) => record.next_block = link.map(|l| l.next_block),
        Err(Error::CorruptMetadata { .. }) => record.broken_link = true,
        Err(e) => return Err(e),
    }

    Ok(record)
}

/// Lazy, finite traversal of every block in device order.
///
/// Restart by calling `FlogFs::walk` again.
pub struct Walk<'a, D: FlashDevice> {
    flash: &'a mut Flash<D>,
    next: u32,
}

impl<'a, D: FlashDevice> Walk<'a, D> {
    pub(crate) fn new(flash: &'a mut Flash<D>) -> Self {
        Self { flash, next: 0 }
    }
}

impl<D: FlashDevice> Iterator for Walk<'_, D> {
    type Item = BlockRecord;

    fn next(&mut self) -> Option<BlockRecord> {
        if self.next >= self.flash.geometry().number_of_blocks {
            return None;
        }
        let record = scan_block(self.flash, self.next);
        self.next += 1;
        Some(record)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.flash.geometry().number_of_blocks.saturating_sub(self.next) as usize;
        (left, Some(left))
    }
}

/// Follows a file chain from `first_block`, checking that every block is a
/// file block owned by `file_id`. A chain that leaves the file, loops, or
/// has a broken link is corrupt. Torn sectors are skipped, a committed
/// sector that belongs elsewhere is not.
pub(crate) fn follow_chain<F>(first_block: u32, file_id: u32, max_blocks: u32, mut fetch: F) -> Result<Vec<BlockRecord>>
where
    F: FnMut(u32) -> Result<BlockRecord>,
{
    let mut chain = Vec::new();
    let mut block = first_block;
    loop {
        if chain.len() as u32 >= max_blocks {
            return Err(Error::CorruptMetadata { block });
        }
        let record = fetch(block)?;
        if record.kind != BlockKind::File || record.owner != file_id || record.broken_link {
            return Err(Error::CorruptMetadata { block });
        }
        if record.sectors.iter().any(|s| !s.valid && !s.torn) {
            return Err(Error::CorruptMetadata { block });
        }
        let next = record.next_block;
        chain.push(record);
        match next {
            Some(next) => block = next,
            None => return Ok(chain),
        }
    }
}

/// Summary of a complete walk, used by tooling and tests.
#[derive(Debug, Default)]
pub struct Analysis {
    blocks: Vec<BlockRecord>,
}

impl Analysis {
    pub fn new<I: IntoIterator<Item = BlockRecord>>(walk: I) -> Self {
        Self {
            blocks: walk.into_iter().collect(),
        }
    }

    pub fn blocks(&self) -> &[BlockRecord] {
        &self.blocks
    }

    pub fn number_of_blocks(&self, kind: BlockKind) -> usize {
        self.blocks.iter().filter(|b| b.kind == kind).count()
    }

    pub fn number_of_inode_blocks(&self) -> usize {
        self.number_of_blocks(BlockKind::INode)
    }

    pub fn number_of_file_blocks(&self) -> usize {
        self.number_of_blocks(BlockKind::File)
    }

    /// Files with a creation record and no tombstone.
    pub fn number_of_files(&self) -> usize {
        let mut live: BTreeMap<u32, bool> = BTreeMap::new();
        for record in self.blocks.iter().flat_map(|b| b.inodes.iter()) {
            if let InodeSlot::Valid(inode) = &record.entry {
                let alive = live.entry(inode.file_id).or_insert(true);
                *alive &= !inode.deleted;
            }
        }
        live.values().filter(|&&alive| alive).count()
    }

    /// Every link points at a block of the same kind and no block is linked twice.
    pub fn verify(&self) -> bool {
        let mut targets = BTreeMap::new();
        for block in &self.blocks {
            if block.broken_link {
                return false;
            }
            let Some(next) = block.next_block else { continue };
            let Some(target) = self.blocks.get(next as usize) else { return false };
            if target.kind != block.kind {
                return false;
            }
            if block.is_file() && target.owner != block.owner {
                return false;
            }
            if targets.insert(next, block.block).is_some() {
                return false;
            }
        }
        true
    }
}
