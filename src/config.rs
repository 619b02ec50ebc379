pub const MAGIC: u32 = 0x474F_4C46; // "FLOG" in ASCII, little-endian

pub const ERASED_BYTE: u8 = 0xFF; // State of every byte right after an erase
pub const SPARE_RECORD_SIZE: usize = 8; // flag + kind + length + owner
pub const SPARE_VALID: u8 = 0xA5;

pub const MAX_FILE_NAME_LEN: usize = 32;
pub const INODE_RECORD_SIZE: usize = 22 + MAX_FILE_NAME_LEN; // 5 words + flags + name_len + name
pub const AGE_STAMP_SIZE: usize = 8; // magic + age
pub const LINK_RECORD_SIZE: usize = 8; // next block + next age

pub const HEADER_SLOT: u32 = 0; // Slot holding the age stamp and claim record
pub const FIRST_DATA_SLOT: u32 = 1;

pub const TIMESTAMP_NONE: u32 = u32::MAX; // Erased deleted_at

pub const INODE_FLAG_DELETED: u8 = 0b0000_0001;
