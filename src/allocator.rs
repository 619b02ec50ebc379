//! Block allocation and wear leveling.
//!
//! There is no persisted free list. The candidate set is rebuilt by the
//! mount scan from every erased, stamped block, and a candidate is picked at
//! a random index handed out by the device so erase cycles spread over the
//! whole chip instead of piling up on the lowest free block.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use crate::config::*;
use crate::flash::{Flash, FlashDevice};
use crate::structs::{AgeStamp, AgeStampState, BlockType, LinkRecord, Spare, SpareKind, SpareState};
use crate::{Error, Result};

/// A freshly claimed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Claimed {
    pub block: u32,
    pub age: u32,
}

pub(crate) fn read_age_stamp<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> Result<AgeStampState> {
    let mut buf = [0u8; AGE_STAMP_SIZE];
    flash.read_slot(block, HEADER_SLOT, 0, &mut buf)?;
    Ok(AgeStamp::decode(&buf))
}

/// Reads the claim record of a block, `None` while the block is unclaimed.
pub(crate) fn read_claim<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> Result<Option<(BlockType, u32)>> {
    match flash.read_spare(block, HEADER_SLOT)? {
        SpareState::Erased => Ok(None),
        SpareState::Valid(spare) => match spare.kind.claimed_type() {
            Some(block_type) => Ok(Some((block_type, spare.owner))),
            None => Err(Error::CorruptMetadata { block }),
        },
        SpareState::Garbage => Err(Error::CorruptMetadata { block }),
    }
}

/// Reads the forward link of a block, `None` when it has no successor yet.
///
/// Link data without its spare record is a torn link and reads as corrupt.
pub(crate) fn read_link<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> Result<Option<LinkRecord>> {
    let slot = flash.geometry().link_slot();
    match flash.read_spare(block, slot)? {
        SpareState::Erased if flash.slot_is_erased(block, slot)? => Ok(None),
        SpareState::Valid(spare) if spare.kind == SpareKind::Link => {
            let mut buf = [0u8; LINK_RECORD_SIZE];
            flash.read_slot(block, slot, 0, &mut buf)?;
            let link = LinkRecord::decode(&buf);
            if link.next_block >= flash.geometry().number_of_blocks {
                return Err(Error::CorruptMetadata { block });
            }
            Ok(Some(link))
        }
        _ => Err(Error::CorruptMetadata { block }),
    }
}

/// Links `block` to its successor. The link slot is programmed exactly once.
pub(crate) fn write_link<D: FlashDevice>(flash: &mut Flash<D>, block: u32, next: Claimed) -> Result<()> {
    let slot = flash.geometry().link_slot();
    let link = LinkRecord {
        next_block: next.block,
        next_age: next.age,
    };
    log::debug!("link block {} -> {}", block, next.block);
    flash.program_slot(
        block,
        slot,
        0,
        &link.encode(),
        Some(&Spare::new(SpareKind::Link, LINK_RECORD_SIZE as u16, next.block)),
    )
}

/// Erases a block and stamps it with its incremented erase count.
pub(crate) fn erase_and_stamp<D: FlashDevice>(flash: &mut Flash<D>, block: u32) -> Result<u32> {
    let age = match read_age_stamp(flash, block) {
        Ok(AgeStampState::Stamped(stamp)) => stamp.age.saturating_add(1),
        _ => 1,
    };
    flash.erase(block)?;
    flash.program_slot(block, HEADER_SLOT, 0, &AgeStamp { age }.encode(), None)?;
    Ok(age)
}

#[derive(Debug, Default)]
pub(crate) struct BlockAllocator {
    candidates: Vec<u32>,
    bad: BTreeSet<u32>,
    reclaimable: BTreeSet<u32>,
}

impl BlockAllocator {
    pub(crate) fn from_scan(candidates: Vec<u32>, bad: BTreeSet<u32>, reclaimable: BTreeSet<u32>) -> Self {
        Self {
            candidates,
            bad,
            reclaimable,
        }
    }

    /// Number of erased blocks ready to be claimed.
    pub fn free_blocks(&self) -> usize {
        self.candidates.len()
    }

    pub fn reclaimable_blocks(&self) -> usize {
        self.reclaimable.len()
    }

    pub fn bad_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.bad.iter().copied()
    }

    /// Takes a block that failed to program or erase out of service.
    ///
    /// Data already committed to it stays readable, it is just never erased
    /// or claimed again.
    pub(crate) fn retire<D: FlashDevice>(&mut self, flash: &mut Flash<D>, block: u32) -> Result<()> {
        self.candidates.retain(|&b| b != block);
        self.reclaimable.remove(&block);
        if self.bad.insert(block) {
            flash.mark_bad(block)?;
        }
        Ok(())
    }

    /// Queues a block that no longer holds live data for erasure.
    pub(crate) fn add_reclaimable(&mut self, block: u32) {
        if !self.bad.contains(&block) {
            self.reclaimable.insert(block);
        }
    }

    /// Picks a random erased block, verifies it and writes its claim record.
    ///
    /// When no candidate is left, queued reclaimable blocks are erased and
    /// the pick is retried. Fails with `OutOfSpace` once both pools are empty.
    pub(crate) fn claim_block<D: FlashDevice>(
        &mut self,
        flash: &mut Flash<D>,
        block_type: BlockType,
        owner: u32,
    ) -> Result<Claimed> {
        loop {
            if self.candidates.is_empty() && self.reclaim_pending(flash) == 0 {
                return Err(Error::OutOfSpace);
            }

            let len = self.candidates.len() as u32;
            let index = (flash.random(len) % len) as usize;
            let block = self.candidates.swap_remove(index);

            if flash.is_bad(block)? {
                flash.warn(format_args!("skipping bad block {}", block));
                self.bad.insert(block);
                continue;
            }

            match self.write_claim(flash, block, block_type, owner) {
                Ok(claimed) => {
                    log::debug!("claimed {:?} block {} (age {}) for {}", block_type, block, claimed.age, owner);
                    return Ok(claimed);
                }
                Err(Error::DeviceFailure { .. }) => self.retire(flash, block)?,
                Err(Error::CorruptMetadata { .. }) => {
                    flash.warn(format_args!("candidate block {} is not clean, queueing for erase", block));
                    self.reclaimable.insert(block);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_claim<D: FlashDevice>(
        &mut self,
        flash: &mut Flash<D>,
        block: u32,
        block_type: BlockType,
        owner: u32,
    ) -> Result<Claimed> {
        let claim = Spare::new(SpareKind::claim(block_type), 0, owner);
        match read_age_stamp(flash, block)? {
            AgeStampState::Stamped(stamp) => {
                flash.program_slot(block, HEADER_SLOT, 0, &[], Some(&claim))?;
                Ok(Claimed { block, age: stamp.age })
            }
            AgeStampState::Erased => {
                let stamp = AgeStamp { age: 0 };
                flash.program_slot(block, HEADER_SLOT, 0, &stamp.encode(), Some(&claim))?;
                Ok(Claimed { block, age: 0 })
            }
            AgeStampState::Garbage => Err(Error::CorruptMetadata { block }),
        }
    }

    /// Erases a block and returns it to the candidate set.
    pub(crate) fn erase_and_reclaim<D: FlashDevice>(&mut self, flash: &mut Flash<D>, block: u32) -> Result<()> {
        self.reclaimable.remove(&block);
        match erase_and_stamp(flash, block) {
            Ok(age) => {
                log::debug!("reclaimed block {} (age {})", block, age);
                self.candidates.push(block);
                Ok(())
            }
            Err(Error::DeviceFailure { .. }) => {
                self.retire(flash, block)?;
                Err(Error::DeviceFailure { block })
            }
            Err(e) => Err(e),
        }
    }

    fn reclaim_pending<D: FlashDevice>(&mut self, flash: &mut Flash<D>) -> usize {
        let pending: Vec<u32> = self.reclaimable.iter().copied().collect();
        if !pending.is_empty() {
            log::info!("out of erased blocks, reclaiming {}", pending.len());
        }
        for block in pending {
            if let Err(e) = self.erase_and_reclaim(flash, block) {
                flash.warn(format_args!("failed to reclaim block {}: {}", block, e));
            }
        }
        self.candidates.len()
    }
}
