use std::collections::BTreeMap;

use crate::TransferError;
use crate::types::ChunkDescriptor;

/// Result of storing one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// First time this index was seen.
    New,
    /// The index was already present; its bytes were replaced.
    Replaced { previous_len: usize },
}

/// Index-keyed payload store for one upload session.
///
/// `received_bytes` is always the sum of the currently stored payloads and
/// `received_chunks` the number of distinct indices, so retransmitting a
/// chunk never double-counts.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    total_chunks: u32,
    declared_total: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
    received_bytes: u64,
}

impl ChunkBuffer {
    /// Creates an empty buffer expecting `total_chunks` chunks summing to
    /// `declared_total` bytes.
    pub fn new(total_chunks: u32, declared_total: u64) -> Self {
        Self {
            total_chunks,
            declared_total,
            chunks: BTreeMap::new(),
            received_bytes: 0,
        }
    }

    /// Stores a chunk at its index, replacing any bytes already there.
    ///
    /// The buffer is left untouched on error. An out-of-range index is a
    /// per-chunk problem; [`TransferError::Overflow`] means the session can
    /// no longer match its declared size.
    pub fn store(&mut self, chunk: ChunkDescriptor) -> Result<StoreOutcome, TransferError> {
        let index = chunk.index;
        if index == 0 || index > self.total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }

        let previous_len = self.chunks.get(&index).map_or(0, Vec::len);
        let received = self.received_bytes - previous_len as u64 + chunk.payload.len() as u64;
        if received > self.declared_total {
            return Err(TransferError::Overflow {
                received,
                declared: self.declared_total,
            });
        }

        self.received_bytes = received;
        match self.chunks.insert(index, chunk.payload) {
            Some(_) => Ok(StoreOutcome::Replaced { previous_len }),
            None => Ok(StoreOutcome::New),
        }
    }

    /// Number of distinct indices stored.
    pub fn received_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Sum of the stored payload sizes.
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn declared_total(&self) -> u64 {
        self.declared_total
    }

    /// Returns `true` once every index in `1..=total_chunks` is present.
    pub fn is_complete(&self) -> bool {
        self.received_chunks() == self.total_chunks
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> Vec<u32> {
        (1..=self.total_chunks)
            .filter(|i| !self.chunks.contains_key(i))
            .collect()
    }

    /// Drops every stored payload, releasing the memory.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.received_bytes = 0;
    }

    /// Consumes the buffer and yields the payloads in index order.
    pub fn into_ordered(self) -> Result<Vec<Vec<u8>>, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::Incomplete {
                missing: self.missing().len(),
            });
        }
        // BTreeMap iterates keys in ascending order.
        Ok(self.chunks.into_values().collect())
    }
}
