//! File chains and the read/write handles that move along them.

use alloc::string::String;
use alloc::vec::Vec;

use crate::allocator::{read_claim, read_link, write_link, BlockAllocator};
use crate::config::*;
use crate::directory::DirEntry;
use crate::flash::{Flash, FlashDevice};
use crate::structs::{BlockType, Spare, SpareKind, SpareState};
use crate::walk::{follow_chain, scan_block, BlockRecord};
use crate::{Error, Result};

/// Append cursor of a file open for writing. Owned by the caller until closed.
#[derive(Debug)]
pub struct WriteHandle {
    pub(crate) file_id: u32,
    pub(crate) name: String,
    pub(crate) block: u32,
    pub(crate) slot: u32,
    /// Bytes of the current sector not yet programmed.
    pub(crate) buffer: Vec<u8>,
    pub(crate) file_size: u64,
}

impl WriteHandle {
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block the next sector will be programmed into.
    pub fn block(&self) -> u32 {
        self.block
    }

    /// Slot (`page * sectors_per_page + sector`) the next sector will use.
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }
}

/// Read cursor over a file chain. Never mutates flash.
#[derive(Debug)]
pub struct ReadHandle {
    pub(crate) file_id: u32,
    pub(crate) first_block: u32,
    pub(crate) file_size: u64,
    pub(crate) block: u32,
    pub(crate) slot: u32,
    pub(crate) offset: u32,
    pub(crate) position: u64,
    pub(crate) eof: bool,
}

impl ReadHandle {
    pub(crate) fn new(entry: &DirEntry) -> Self {
        Self {
            file_id: entry.file_id,
            first_block: entry.first_block,
            file_size: entry.size,
            block: entry.first_block,
            slot: FIRST_DATA_SLOT,
            offset: 0,
            position: 0,
            eof: false,
        }
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    fn rewind(&mut self) {
        self.block = self.first_block;
        self.slot = FIRST_DATA_SLOT;
        self.offset = 0;
        self.position = 0;
        self.eof = false;
    }
}

/// Walks the chain of an existing file on flash.
pub(crate) fn chain<D: FlashDevice>(flash: &mut Flash<D>, file_id: u32, first_block: u32) -> Result<Vec<BlockRecord>> {
    let max_blocks = flash.geometry().number_of_blocks;
    follow_chain(first_block, file_id, max_blocks, |block| Ok(scan_block(flash, block)))
}

/// Positions a write handle after the last programmed sector of a file.
pub(crate) fn open_append<D: FlashDevice>(flash: &mut Flash<D>, entry: &DirEntry) -> Result<WriteHandle> {
    let chain = chain(flash, entry.file_id, entry.first_block)?;
    let size = chain.iter().map(|b| b.bytes_in_block as u64).sum();
    let (block, slot) = match chain.last() {
        Some(last) => (
            last.block,
            last.append_slot.unwrap_or(flash.geometry().last_data_slot() + 1),
        ),
        None => (entry.first_block, FIRST_DATA_SLOT),
    };
    log::debug!("reopened {:?} at {}/{} size {}", entry.name, block, slot, size);
    Ok(WriteHandle {
        file_id: entry.file_id,
        name: entry.name.clone(),
        block,
        slot,
        buffer: Vec::new(),
        file_size: size,
    })
}

pub(crate) fn open_new(entry: &DirEntry) -> WriteHandle {
    WriteHandle {
        file_id: entry.file_id,
        name: entry.name.clone(),
        block: entry.first_block,
        slot: FIRST_DATA_SLOT,
        buffer: Vec::new(),
        file_size: 0,
    }
}

/// Claims the next block of the file and links the current one to it.
fn extend_chain<D: FlashDevice>(
    flash: &mut Flash<D>,
    alloc: &mut BlockAllocator,
    handle: &mut WriteHandle,
) -> Result<()> {
    let next = alloc.claim_block(flash, BlockType::File, handle.file_id)?;
    if let Err(e) = write_link(flash, handle.block, next) {
        alloc.add_reclaimable(next.block);
        if let Error::DeviceFailure { .. } = e {
            alloc.retire(flash, handle.block)?;
        }
        return Err(e);
    }
    handle.block = next.block;
    handle.slot = FIRST_DATA_SLOT;
    Ok(())
}

/// Moves the cursor out of a block that failed to program.
///
/// Committed sectors stay where they are. The failed block is retired and
/// linked from its own link slot to a fresh block.
fn relocate<D: FlashDevice>(flash: &mut Flash<D>, alloc: &mut BlockAllocator, handle: &mut WriteHandle) -> Result<()> {
    flash.warn(format_args!(
        "program failed at {}/{}, moving {:?} to a fresh block",
        handle.block, handle.slot, handle.name
    ));
    alloc.retire(flash, handle.block)?;
    extend_chain(flash, alloc, handle)
}

/// Programs the buffered bytes into the cursor's sector and moves to the next one.
fn flush_sector<D: FlashDevice>(
    flash: &mut Flash<D>,
    alloc: &mut BlockAllocator,
    handle: &mut WriteHandle,
) -> Result<()> {
    if handle.buffer.is_empty() {
        return Ok(());
    }
    let spare = Spare::new(SpareKind::FileData, handle.buffer.len() as u16, handle.file_id);
    loop {
        match flash.program_slot(handle.block, handle.slot, 0, &handle.buffer, Some(&spare)) {
            Ok(()) => break,
            Err(Error::DeviceFailure { .. }) => relocate(flash, alloc, handle)?,
            Err(e) => return Err(e),
        }
    }
    handle.buffer.clear();
    handle.slot += 1;
    Ok(())
}

/// Reports bytes already accepted instead of an error; the next call sees it again.
fn partial(written: usize, e: Error) -> Result<usize> {
    match e {
        Error::InvariantViolation { .. } => Err(e),
        _ if written > 0 => Ok(written),
        _ => Err(e),
    }
}

/// Writes data from the provided buffer at the end of the file.
///
/// Full sectors are programmed as soon as they fill up, a partial sector
/// stays buffered until more data arrives or the handle is closed.
/// Returns the number of bytes accepted, which is short when the device
/// failed or ran out of blocks after some bytes were taken. The file size
/// only ever counts accepted bytes.
pub(crate) fn fwrite<D: FlashDevice>(
    flash: &mut Flash<D>,
    alloc: &mut BlockAllocator,
    handle: &mut WriteHandle,
    data: &[u8],
) -> Result<usize> {
    let sector_size = flash.geometry().sector_size as usize;
    let last_data_slot = flash.geometry().last_data_slot();
    let mut written = 0;

    while written < data.len() {
        if handle.slot > last_data_slot {
            if let Err(e) = extend_chain(flash, alloc, handle) {
                return partial(written, e);
            }
        }

        let buffered = handle.buffer.len();
        let n = (sector_size - buffered).min(data.len() - written);
        handle.buffer.extend_from_slice(&data[written..written + n]);
        if handle.buffer.len() == sector_size {
            if let Err(e) = flush_sector(flash, alloc, handle) {
                handle.buffer.truncate(buffered);
                return partial(written, e);
            }
        }
        written += n;
        handle.file_size += n as u64;
    }

    Ok(written)
}

/// Programs whatever is still buffered. Returns the block the file ends in.
pub(crate) fn fclose<D: FlashDevice>(
    flash: &mut Flash<D>,
    alloc: &mut BlockAllocator,
    handle: &mut WriteHandle,
) -> Result<u32> {
    flush_sector(flash, alloc, handle)?;
    Ok(handle.block)
}

/// Moves to the successor of the current block, or marks EOF if there is none.
fn next_block<D: FlashDevice>(flash: &mut Flash<D>, handle: &mut ReadHandle) -> Result<bool> {
    let Some(link) = read_link(flash, handle.block)? else {
        handle.eof = true;
        return Ok(false);
    };
    match read_claim(flash, link.next_block)? {
        Some((BlockType::File, owner)) if owner == handle.file_id => {}
        _ => return Err(Error::CorruptMetadata { block: link.next_block }),
    }
    handle.block = link.next_block;
    handle.slot = FIRST_DATA_SLOT;
    handle.offset = 0;
    Ok(true)
}

/// Advances the cursor by up to `want` bytes, copying them into `out` if given.
fn advance<D: FlashDevice>(
    flash: &mut Flash<D>,
    handle: &mut ReadHandle,
    want: u64,
    mut out: Option<&mut [u8]>,
) -> Result<u64> {
    let last_data_slot = flash.geometry().last_data_slot();
    let mut done = 0u64;

    while done < want {
        if handle.position >= handle.file_size {
            handle.eof = true;
            break;
        }
        if handle.slot > last_data_slot {
            if !next_block(flash, handle)? {
                break;
            }
            continue;
        }

        let length = match flash.read_spare(handle.block, handle.slot)? {
            SpareState::Erased if flash.slot_is_erased(handle.block, handle.slot)? => {
                if !next_block(flash, handle)? {
                    break;
                }
                continue;
            }
            SpareState::Erased | SpareState::Garbage => {
                // Torn program, never committed.
                handle.slot += 1;
                handle.offset = 0;
                continue;
            }
            SpareState::Valid(spare) if spare.kind == SpareKind::FileData && spare.owner == handle.file_id => {
                spare.length as u32
            }
            _ => return Err(Error::CorruptMetadata { block: handle.block }),
        };

        if handle.offset >= length {
            handle.slot += 1;
            handle.offset = 0;
            continue;
        }

        let n = ((length - handle.offset) as u64)
            .min(want - done)
            .min(handle.file_size - handle.position);
        if let Some(out) = out.as_deref_mut() {
            let at = done as usize;
            flash.read_slot(handle.block, handle.slot, handle.offset, &mut out[at..at + n as usize])?;
        }
        handle.offset += n as u32;
        handle.position += n;
        done += n;
    }

    Ok(done)
}

/// Reads data from the cursor into the provided buffer.
/// Returns the number of bytes read, 0 once the end of the file was reached.
pub(crate) fn fread<D: FlashDevice>(flash: &mut Flash<D>, handle: &mut ReadHandle, buffer: &mut [u8]) -> Result<usize> {
    if handle.eof {
        return Ok(0);
    }
    let read = advance(flash, handle, buffer.len() as u64, Some(buffer))?;
    Ok(read as usize)
}

/// Moves the cursor to an absolute offset by walking the chain from its first block.
pub(crate) fn fseek<D: FlashDevice>(flash: &mut Flash<D>, handle: &mut ReadHandle, offset: u64) -> Result<()> {
    if offset > handle.file_size {
        return Err(Error::OutOfRange {
            offset,
            size: handle.file_size,
        });
    }
    handle.rewind();
    let skipped = advance(flash, handle, offset, None)?;
    if skipped != offset {
        return Err(Error::CorruptMetadata { block: handle.block });
    }
    handle.eof = false;
    Ok(())
}
