//! Binary shapes of everything flogfs puts on flash.
//!
//! All fields are little-endian and byte addressed, no alignment is assumed.
//! A record is programmed once and never rewritten until its block is erased.

use alloc::string::String;

use crate::config::*;
use crate::{Error, Result};

/// Kind of a programmed block, carried by the claim record in the header slot spare.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    INode = 0x11,
    File = 0x12,
}

/// What a valid spare record describes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpareKind {
    ClaimINode = 0x11,
    ClaimFile = 0x12,
    INodeEntry = 0x21,
    FileData = 0x22,
    Link = 0x31,
}

impl SpareKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::ClaimINode),
            0x12 => Some(Self::ClaimFile),
            0x21 => Some(Self::INodeEntry),
            0x22 => Some(Self::FileData),
            0x31 => Some(Self::Link),
            _ => None,
        }
    }

    pub fn claim(block_type: BlockType) -> Self {
        match block_type {
            BlockType::INode => Self::ClaimINode,
            BlockType::File => Self::ClaimFile,
        }
    }

    pub fn claimed_type(self) -> Option<BlockType> {
        match self {
            Self::ClaimINode => Some(BlockType::INode),
            Self::ClaimFile => Some(BlockType::File),
            _ => None,
        }
    }
}

/// Per-sector metadata stored in the page's spare table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spare {
    pub kind: SpareKind,
    /// Payload length for file sectors, record length otherwise.
    pub length: u16,
    /// File id for claims of file blocks and file data, sequence for inode claims.
    pub owner: u32,
}

/// Decoded state of a spare record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpareState {
    Erased,
    Valid(Spare),
    Garbage,
}

impl Spare {
    pub fn new(kind: SpareKind, length: u16, owner: u32) -> Self {
        Self { kind, length, owner }
    }

    pub fn encode(&self) -> [u8; SPARE_RECORD_SIZE] {
        let mut buf = [0u8; SPARE_RECORD_SIZE];
        buf[0] = SPARE_VALID;
        buf[1] = self.kind as u8;
        buf[2..4].copy_from_slice(&self.length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.owner.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; SPARE_RECORD_SIZE]) -> SpareState {
        if buf.iter().all(|&b| b == ERASED_BYTE) {
            return SpareState::Erased;
        }
        if buf[0] != SPARE_VALID {
            return SpareState::Garbage;
        }
        match SpareKind::from_u8(buf[1]) {
            Some(kind) => SpareState::Valid(Spare {
                kind,
                length: u16::from_le_bytes([buf[2], buf[3]]),
                owner: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            }),
            None => SpareState::Garbage,
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Written into the header slot right after every erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgeStamp {
    pub age: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeStampState {
    Erased,
    Stamped(AgeStamp),
    Garbage,
}

impl AgeStamp {
    pub fn encode(&self) -> [u8; AGE_STAMP_SIZE] {
        let mut buf = [0u8; AGE_STAMP_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.age.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; AGE_STAMP_SIZE]) -> AgeStampState {
        if buf.iter().all(|&b| b == ERASED_BYTE) {
            return AgeStampState::Erased;
        }
        if read_u32(buf, 0) != MAGIC {
            return AgeStampState::Garbage;
        }
        AgeStampState::Stamped(AgeStamp { age: read_u32(buf, 4) })
    }
}

/// Forward link stored in the last slot of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRecord {
    pub next_block: u32,
    pub next_age: u32,
}

impl LinkRecord {
    pub fn encode(&self) -> [u8; LINK_RECORD_SIZE] {
        let mut buf = [0u8; LINK_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.next_block.to_le_bytes());
        buf[4..8].copy_from_slice(&self.next_age.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; LINK_RECORD_SIZE]) -> Self {
        Self {
            next_block: read_u32(buf, 0),
            next_age: read_u32(buf, 4),
        }
    }
}

/// One entry of the inode directory log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub file_id: u32,
    pub created_at: u32,
    pub deleted_at: u32,
    pub first_block: u32,
    pub last_block: u32,
    pub deleted: bool,
    pub name: String,
}

impl InodeRecord {
    pub fn encode(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0u8; INODE_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.created_at.to_le_bytes());
        buf[8..12].copy_from_slice(&self.deleted_at.to_le_bytes());
        buf[12..16].copy_from_slice(&self.first_block.to_le_bytes());
        buf[16..20].copy_from_slice(&self.last_block.to_le_bytes());
        buf[20] = if self.deleted { INODE_FLAG_DELETED } else { 0 };
        let name = self.name.as_bytes();
        buf[21] = name.len() as u8;
        buf[22..22 + name.len()].copy_from_slice(name);
        buf
    }

    /// Returns `None` when the bytes cannot be an inode record.
    pub fn decode(buf: &[u8; INODE_RECORD_SIZE]) -> Option<Self> {
        let flags = buf[20];
        if flags & !INODE_FLAG_DELETED != 0 {
            return None;
        }
        let name_len = buf[21] as usize;
        if name_len == 0 || name_len > MAX_FILE_NAME_LEN {
            return None;
        }
        let name = core::str::from_utf8(&buf[22..22 + name_len]).ok()?;
        Some(Self {
            file_id: read_u32(buf, 0),
            created_at: read_u32(buf, 4),
            deleted_at: read_u32(buf, 8),
            first_block: read_u32(buf, 12),
            last_block: read_u32(buf, 16),
            deleted: flags & INODE_FLAG_DELETED != 0,
            name: String::from(name),
        })
    }
}

/// Names are stored inline in inode records, so they are bounded and may not contain NUL.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FILE_NAME_LEN || name.contains('\0') {
        return Err(Error::InvalidFileName);
    }
    Ok(())
}
