use thiserror::Error;

/// Errors surfaced by the filesystem core.
///
/// Device and structural errors are recovered at the smallest scope
/// possible (a block or a record) while mounting and listing. Handle level
/// errors go straight back to the caller.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The flash device reported a read, program or erase failure.
    #[error("flash device failure on block {block}")]
    DeviceFailure { block: u32 },

    /// No erased block is left to claim.
    #[error("no space left on flash")]
    OutOfSpace,

    #[error("file not found")]
    NotFound,

    #[error("file already exists")]
    AlreadyExists,

    /// Seek target lies beyond the end of the file.
    #[error("offset {offset} beyond file size {size}")]
    OutOfRange { offset: u64, size: u64 },

    /// A header, spare or record did not decode, or a chain could not be walked.
    #[error("corrupt metadata in block {block}")]
    CorruptMetadata { block: u32 },

    /// Attempt to program bytes that are not erased. Never recoverable.
    #[error("write to non-erased sector (block {block}, page {page}, sector {sector})")]
    InvariantViolation { block: u32, page: u32, sector: u32 },

    /// Mount found no inode log on the device.
    #[error("device is not formatted")]
    NotFormatted,

    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("invalid flash geometry")]
    InvalidGeometry,

    #[error("invalid file name")]
    InvalidFileName,
}

pub type Result<T> = core::result::Result<T, FsError>;
