use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use crate::allocator::{erase_and_stamp, read_age_stamp, BlockAllocator};
use crate::directory::{Directory, Listing};
use crate::file::{self, ReadHandle, WriteHandle};
use crate::flash::{Flash, FlashDevice, FlashEvent};
use crate::inode::{self, InodeLog};
use crate::structs::{AgeStampState, InodeRecord};
use crate::walk::{follow_chain, BlockFault, BlockKind, BlockRecord, InodeSlot, Walk};
use crate::{Error, Geometry, Result};

/// Findings of `FlogFs::self_check`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CheckReport {
    /// Files whose chain could not be walked, with the offending block.
    pub broken_chains: Vec<(String, u32)>,
    /// Names with more than one active inode record on flash.
    pub duplicate_names: Vec<String>,
    /// Files whose on-flash byte count disagrees with the directory: (name, directory, flash).
    pub size_mismatches: Vec<(String, u64, u64)>,
    /// Blocks whose header could not be decoded.
    pub corrupt_blocks: Vec<u32>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.broken_chains.is_empty()
            && self.duplicate_names.is_empty()
            && self.size_mismatches.is_empty()
            && self.corrupt_blocks.is_empty()
    }
}

/// State that only exists while mounted.
#[derive(Debug)]
struct Mounted {
    alloc: BlockAllocator,
    log: InodeLog,
    directory: Directory,
}

pub struct FlogFs<D: FlashDevice> {
    flash: Flash<D>,
    mounted: Option<Mounted>,
    /// Set once a write hit non-erased bytes; cleared by format or mount.
    poisoned: Option<Error>,
}

impl<D: FlashDevice> FlogFs<D> {
    /// Binds a device to a geometry. The device is neither formatted nor mounted.
    pub fn initialize(mut device: D, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        device.initialize(&geometry)?;
        Ok(Self {
            flash: Flash::new(device, geometry),
            mounted: None,
            poisoned: None,
        })
    }

    /// Erases every usable block and starts an empty inode log.
    ///
    /// Erase counts survive: each block is stamped with its previous age plus one.
    /// The filesystem has to be mounted afterwards.
    pub fn format(&mut self) -> Result<()> {
        self.mounted = None;
        self.poisoned = None;
        self.flash.event(FlashEvent::FormatBegin);

        let number_of_blocks = self.flash.geometry().number_of_blocks;
        let mut candidates = Vec::new();
        let mut bad = BTreeSet::new();
        for block in 0..number_of_blocks {
            if self.flash.is_bad(block)? {
                log::warn!("format: skipping bad block {}", block);
                bad.insert(block);
                continue;
            }
            match erase_and_stamp(&mut self.flash, block) {
                Ok(_) => candidates.push(block),
                Err(Error::DeviceFailure { .. }) => {
                    self.flash.mark_bad(block)?;
                    bad.insert(block);
                }
                Err(e) => {
                    self.flash.event(FlashEvent::FormatEnd);
                    return Err(e);
                }
            }
        }

        let mut alloc = BlockAllocator::from_scan(candidates, bad, BTreeSet::new());
        let result = InodeLog::create_head(&mut self.flash, &mut alloc);
        self.flash.close();
        self.flash.event(FlashEvent::FormatEnd);
        let log = result?;
        log::info!(
            "formatted {} blocks, inode log at block {}, {} free",
            number_of_blocks,
            log.head(),
            alloc.free_blocks()
        );
        Ok(())
    }

    /// Rebuilds the allocator, the inode log cursor and the directory from a full walk.
    ///
    /// Fails with `NotFormatted` when no inode log exists. Corrupt blocks and
    /// records are skipped, files whose chain is broken are kept but flagged.
    pub fn mount(&mut self) -> Result<()> {
        self.mounted = None;
        self.poisoned = None;
        self.flash.event(FlashEvent::PrimeBegin);
        let blocks: Vec<BlockRecord> = Walk::new(&mut self.flash).collect();
        self.flash.close();
        self.flash.event(FlashEvent::PrimeEnd);

        let mounted = self.prime(blocks)?;
        log::info!(
            "mounted: {} files, {} free blocks, {} reclaimable",
            mounted.directory.len(),
            mounted.alloc.free_blocks(),
            mounted.alloc.reclaimable_blocks()
        );
        self.mounted = Some(mounted);
        Ok(())
    }

    fn prime(&self, blocks: Vec<BlockRecord>) -> Result<Mounted> {
        let geometry = *self.flash.geometry();
        let mut candidates = Vec::new();
        let mut bad = BTreeSet::new();
        let mut reclaimable = BTreeSet::new();
        let mut inode_blocks: BTreeMap<u32, BlockRecord> = BTreeMap::new();
        let mut file_blocks: BTreeMap<u32, BlockRecord> = BTreeMap::new();

        for record in blocks {
            if record.bad {
                bad.insert(record.block);
            }
            match record.kind {
                BlockKind::Unallocated => candidates.push(record.block),
                BlockKind::INode => {
                    inode_blocks.insert(record.block, record);
                }
                BlockKind::File => {
                    file_blocks.insert(record.block, record);
                }
                BlockKind::Error(BlockFault::CorruptHeader) => {
                    reclaimable.insert(record.block);
                }
                BlockKind::Error(_) => {
                    bad.insert(record.block);
                }
            }
        }

        // A bad block format could not erase may still carry an old head.
        let head = inode_blocks
            .values()
            .filter(|b| b.owner == 0)
            .max_by_key(|b| (!b.bad, b.age))
            .map(|b| b.block);
        let Some(head) = head else {
            return Err(Error::NotFormatted);
        };

        // Follow the log from its head; anything claimed as inode but not on the chain is garbage.
        let mut log_chain = Vec::new();
        let mut sealed = false;
        let mut block = head;
        loop {
            let Some(record) = inode_blocks.get(&block) else { break };
            if record.owner != log_chain.len() as u32 || log_chain.contains(&block) {
                break;
            }
            log_chain.push(block);
            if record.broken_link {
                sealed = true;
                break;
            }
            match record.next_block {
                Some(next) if inode_blocks.get(&next).is_some_and(|n| n.owner == record.owner + 1) => block = next,
                Some(next) => {
                    log::warn!("inode block {} links to foreign block {}", block, next);
                    sealed = true;
                    break;
                }
                None => break,
            }
        }

        let records: Vec<&InodeRecord> = log_chain
            .iter()
            .filter_map(|b| inode_blocks.get(b))
            .flat_map(|b| b.inodes.iter())
            .filter_map(|s| match &s.entry {
                InodeSlot::Valid(record) => Some(record),
                InodeSlot::Garbage => None,
            })
            .collect();
        let folded = Directory::fold(records.iter().copied());
        let mut directory = folded.directory;

        // Blocks that stay: every chain block of a readable file, every block owned by a corrupt one.
        let mut live: BTreeSet<u32> = BTreeSet::new();
        for entry in directory.entries_mut() {
            let walked = follow_chain(entry.first_block, entry.file_id, geometry.number_of_blocks, |b| {
                file_blocks.get(&b).cloned().ok_or(Error::CorruptMetadata { block: b })
            });
            match walked {
                Ok(chain) => {
                    entry.size = chain.iter().map(|b| b.bytes_in_block as u64).sum();
                    entry.last_block = chain.last().map_or(entry.first_block, |b| b.block);
                    live.extend(chain.iter().map(|b| b.block));
                }
                Err(e) => {
                    log::warn!("file {:?} is corrupt: {}", entry.name, e);
                    entry.corrupt = true;
                    live.extend(file_blocks.values().filter(|b| b.owner == entry.file_id).map(|b| b.block));
                }
            }
        }

        reclaimable.extend(file_blocks.keys().filter(|&b| !live.contains(b) && !bad.contains(b)).copied());
        reclaimable.extend(inode_blocks.keys().filter(|&b| !log_chain.contains(b) && !bad.contains(b)).copied());

        let tail = log_chain.last().copied().unwrap_or(head);
        let tail_record = &inode_blocks[&tail];
        let mut log = InodeLog::resume(
            head,
            tail,
            tail_record.owner,
            tail_record.append_slot,
            folded.highest_file_id,
            folded.latest_time,
        );
        if sealed {
            log.seal();
        }

        Ok(Mounted {
            alloc: BlockAllocator::from_scan(candidates, bad, reclaimable),
            log,
            directory,
        })
    }

    pub fn unmount(&mut self) {
        self.flash.close();
        self.mounted = None;
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn mounted(&self) -> Result<&Mounted> {
        self.mounted.as_ref().ok_or(Error::NotMounted)
    }

    /// Mutable state plus the flash, for operations that program.
    fn writable(&mut self) -> Result<(&mut Flash<D>, &mut Mounted)> {
        if let Some(e) = self.poisoned {
            return Err(e);
        }
        let mounted = self.mounted.as_mut().ok_or(Error::NotMounted)?;
        Ok((&mut self.flash, mounted))
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e @ Error::InvariantViolation { .. }) = result {
            self.poisoned = Some(e);
        }
        result
    }

    /// Opens `name` for appending, creating it when it does not exist.
    pub fn open_write(&mut self, name: &str) -> Result<WriteHandle> {
        let (flash, mounted) = self.writable()?;
        let result = match mounted.directory.lookup(name) {
            Some(entry) if entry.corrupt => Err(Error::CorruptMetadata { block: entry.first_block }),
            Some(entry) => {
                let entry = entry.clone();
                file::open_append(flash, &entry)
            }
            None => mounted
                .log
                .create(flash, &mut mounted.alloc, &mut mounted.directory, name)
                .map(|entry| file::open_new(&entry)),
        };
        self.latch(result)
    }

    /// Appends `data`. Returns the number of bytes accepted.
    pub fn write(&mut self, handle: &mut WriteHandle, data: &[u8]) -> Result<usize> {
        let (flash, mounted) = self.writable()?;
        let result = file::fwrite(flash, &mut mounted.alloc, handle, data);
        self.latch(result)
    }

    /// Programs buffered data and records the final size and block in the directory.
    pub fn close_write(&mut self, mut handle: WriteHandle) -> Result<()> {
        let (flash, mounted) = self.writable()?;
        let result = file::fclose(flash, &mut mounted.alloc, &mut handle).map(|last_block| {
            if let Some(entry) = mounted.directory.lookup_mut(&handle.name) {
                if entry.file_id == handle.file_id {
                    entry.size = handle.file_size;
                    entry.last_block = last_block;
                }
            }
        });
        flash.close();
        self.latch(result)
    }

    pub fn open_read(&mut self, name: &str) -> Result<ReadHandle> {
        let entry = inode::lookup(&self.mounted()?.directory, name)?;
        if entry.corrupt {
            return Err(Error::CorruptMetadata { block: entry.first_block });
        }
        Ok(ReadHandle::new(entry))
    }

    /// Reads into `buffer`, returning 0 at end of file.
    pub fn read(&mut self, handle: &mut ReadHandle, buffer: &mut [u8]) -> Result<usize> {
        self.mounted()?;
        file::fread(&mut self.flash, handle, buffer)
    }

    pub fn read_seek(&mut self, handle: &mut ReadHandle, offset: u64) -> Result<()> {
        self.mounted()?;
        file::fseek(&mut self.flash, handle, offset)
    }

    pub fn close_read(&mut self, handle: ReadHandle) -> Result<()> {
        self.mounted()?;
        drop(handle);
        self.flash.close();
        Ok(())
    }

    pub fn check_exists(&self, name: &str) -> bool {
        self.mounted
            .as_ref()
            .is_some_and(|m| m.directory.contains(name))
    }

    /// Appends a tombstone for `name` and queues the file's blocks for reclamation.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        let (flash, mounted) = self.writable()?;
        let result = mounted
            .log
            .delete(flash, &mut mounted.alloc, &mut mounted.directory, name)
            .map(|entry| {
                match file::chain(flash, entry.file_id, entry.first_block) {
                    Ok(chain) => {
                        for block in chain {
                            mounted.alloc.add_reclaimable(block.block);
                        }
                    }
                    Err(e) => log::warn!("not reclaiming blocks of {:?}: {}", entry.name, e),
                }
            });
        flash.close();
        self.latch(result)
    }

    pub fn write_file_size(&self, handle: &WriteHandle) -> u64 {
        handle.file_size()
    }

    pub fn read_file_size(&self, handle: &ReadHandle) -> u64 {
        handle.file_size()
    }

    /// Names of all active files, from the current directory snapshot.
    pub fn start_listing(&self) -> Result<Listing> {
        Ok(Listing::new(&self.mounted()?.directory))
    }

    pub fn next_listing_entry(&self, listing: &mut Listing) -> Option<String> {
        listing.next()
    }

    pub fn stop_listing(&self, listing: Listing) {
        drop(listing);
    }

    /// Walks every block of the device. Works mounted or not.
    pub fn walk(&mut self) -> Walk<'_, D> {
        Walk::new(&mut self.flash)
    }

    /// Verifies chain linkage, name uniqueness and size bookkeeping against a fresh walk.
    pub fn self_check(&mut self) -> Result<CheckReport> {
        let directory = self.mounted()?.directory.clone();
        let mut report = CheckReport::default();

        let blocks: Vec<BlockRecord> = Walk::new(&mut self.flash).collect();
        self.flash.close();
        let mut file_blocks = BTreeMap::new();
        let mut records = Vec::new();
        for block in &blocks {
            match block.kind {
                BlockKind::Error(BlockFault::CorruptHeader) => report.corrupt_blocks.push(block.block),
                BlockKind::File => {
                    file_blocks.insert(block.block, block);
                }
                BlockKind::INode => records.extend(block.inodes.iter().filter_map(|s| match &s.entry {
                    InodeSlot::Valid(record) => Some(record),
                    InodeSlot::Garbage => None,
                })),
                _ => {}
            }
        }

        report.duplicate_names = Directory::fold(records).duplicates;

        let number_of_blocks = self.flash.geometry().number_of_blocks;
        for entry in directory.entries() {
            let walked = follow_chain(entry.first_block, entry.file_id, number_of_blocks, |b| {
                file_blocks
                    .get(&b)
                    .map(|r| (*r).clone())
                    .ok_or(Error::CorruptMetadata { block: b })
            });
            match walked {
                Ok(chain) => {
                    let on_flash: u64 = chain.iter().map(|b| b.bytes_in_block as u64).sum();
                    if on_flash != entry.size {
                        report.size_mismatches.push((entry.name.clone(), entry.size, on_flash));
                    }
                }
                Err(Error::CorruptMetadata { block }) => report.broken_chains.push((entry.name.clone(), block)),
                Err(e) => return Err(e),
            }
        }

        if !report.is_clean() {
            log::warn!("self check: {:?}", report);
        }
        Ok(report)
    }

    pub fn directory(&self) -> Result<&Directory> {
        Ok(&self.mounted()?.directory)
    }

    /// Names of files whose chain was found broken at mount.
    pub fn corrupt_files(&self) -> Vec<String> {
        self.mounted
            .iter()
            .flat_map(|m| m.directory.entries())
            .filter(|e| e.corrupt)
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn free_blocks(&self) -> Result<usize> {
        Ok(self.mounted()?.alloc.free_blocks())
    }

    pub fn reclaimable_blocks(&self) -> Result<usize> {
        Ok(self.mounted()?.alloc.reclaimable_blocks())
    }

    /// Blocks known to be bad, from the device and from failed programs.
    pub fn bad_blocks(&self) -> Result<Vec<u32>> {
        Ok(self.mounted()?.alloc.bad_blocks().collect())
    }

    pub fn inode_log(&self) -> Result<&InodeLog> {
        Ok(&self.mounted()?.log)
    }

    /// Erase count of a block as stamped on flash.
    pub fn block_age(&mut self, block: u32) -> Result<Option<u32>> {
        let state = read_age_stamp(&mut self.flash, block)?;
        self.flash.close();
        Ok(match state {
            AgeStampState::Stamped(stamp) => Some(stamp.age),
            _ => None,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        self.flash.geometry()
    }

    pub fn device(&self) -> &D {
        self.flash.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.flash.device_mut()
    }

    pub fn into_device(self) -> D {
        self.flash.into_inner()
    }
}
