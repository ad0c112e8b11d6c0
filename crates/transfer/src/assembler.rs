use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::TransferError;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// A fully written, hashed file that has not been promoted yet.
///
/// The bytes live in a temporary file that is deleted when this value is
/// dropped, so every path that does not explicitly promote it cleans up.
#[derive(Debug)]
pub struct AssembledFile {
    pub temp: NamedTempFile,
    pub size: u64,
    /// Hex-encoded SHA-256 of the content.
    pub content_hash: String,
}

impl AssembledFile {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

/// Concatenates ordered chunks into a temporary file.
#[derive(Debug, Clone)]
pub struct Assembler {
    temp_dir: PathBuf,
}

impl Assembler {
    /// Temporary files are created inside `temp_dir`. It should be on the
    /// same filesystem as the final storage so promotion is a rename.
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Writes `chunks` in order, hashing as it goes.
    ///
    /// Fails with [`TransferError::SizeMismatch`] when the written length
    /// differs from `declared_total`; the temporary file is removed before
    /// returning in that case and on any I/O error.
    pub fn assemble(
        &self,
        chunks: Vec<Vec<u8>>,
        declared_total: u64,
    ) -> Result<AssembledFile, TransferError> {
        std::fs::create_dir_all(&self.temp_dir)?;
        let mut temp = NamedTempFile::new_in(&self.temp_dir)?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            for chunk in chunks {
                hasher.update(&chunk);
                writer.write_all(&chunk)?;
                size += chunk.len() as u64;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;

        if size != declared_total {
            debug!(
                path = %temp.path().display(),
                declared = declared_total,
                actual = size,
                "assembled size mismatch, discarding"
            );
            return Err(TransferError::SizeMismatch {
                declared: declared_total,
                actual: size,
            });
        }

        Ok(AssembledFile {
            temp,
            size,
            content_hash: hex::encode(hasher.finalize()),
        })
    }
}
