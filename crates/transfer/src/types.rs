use std::time::Instant;

/// One indexed fragment of an upload, as handed to a session's buffer.
#[derive(Debug, Clone)]
pub struct ChunkDescriptor {
    pub upload_id: String,
    /// 1-based position within the file.
    pub index: u32,
    pub total_chunks: u32,
    pub payload: Vec<u8>,
    pub arrival_time: Instant,
}

impl ChunkDescriptor {
    pub fn new(upload_id: impl Into<String>, index: u32, total_chunks: u32, payload: Vec<u8>) -> Self {
        Self {
            upload_id: upload_id.into(),
            index,
            total_chunks,
            payload,
            arrival_time: Instant::now(),
        }
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
