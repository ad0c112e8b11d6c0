//! Chunk buffering, progress tracking and file assembly.
//!
//! Chunks are stored by index rather than by arrival order, so
//! out-of-order delivery and retransmission need no special casing: a
//! session's buffer is a fold over an unordered set of `(index, bytes)`
//! pairs. Once every index is present the [`Assembler`] concatenates them
//! into a temporary file and hashes the result.

mod assembler;
mod buffer;
mod progress;
mod types;
mod validation;

pub use assembler::{AssembledFile, Assembler, checksum_bytes};
pub use buffer::{ChunkBuffer, StoreOutcome};
pub use progress::{MilestoneTracker, PROGRESS_BAR_WIDTH, ProgressSnapshot};
pub use types::ChunkDescriptor;
pub use validation::{MAX_FILE_NAME_LEN, sanitize_file_name, split_extension, validate_file_name};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chunk index {index} outside 1..={total}")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("received {received} bytes, more than the declared {declared}")]
    Overflow { received: u64, declared: u64 },

    #[error("assembled {actual} bytes but {declared} were declared")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("cannot assemble: {missing} chunk(s) missing")]
    Incomplete { missing: usize },

    #[error("invalid file name: {0}")]
    InvalidFileName(String),
}
