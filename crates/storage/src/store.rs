use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::record::{FileRecord, NewFileRecord, RecordId};

/// Persistence for [`FileRecord`]s.
///
/// Lookups by hash return every match; callers pick the canonical one with
/// [`select_canonical`](crate::select_canonical) instead of assuming there
/// is at most one.
pub trait RecordStore: Send + Sync {
    /// Assigns an id and creation time and stores the record.
    fn insert(&self, record: NewFileRecord) -> Result<FileRecord, StorageError>;

    fn get(&self, id: RecordId) -> Option<FileRecord>;

    /// All records with the given content hash, in id order.
    fn find_by_hash(&self, content_hash: &str) -> Vec<FileRecord>;

    /// Turns `id` into a duplicate of `canonical`, pointing it at the
    /// canonical bytes.
    fn mark_duplicate(&self, id: RecordId, canonical: &FileRecord)
    -> Result<FileRecord, StorageError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One line of the on-disk journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalEntry {
    Insert {
        record: FileRecord,
    },
    #[serde(rename_all = "camelCase")]
    MarkDuplicate {
        id: RecordId,
        canonical_id: RecordId,
        canonical_path: PathBuf,
    },
}

struct Inner {
    records: BTreeMap<RecordId, FileRecord>,
    by_hash: HashMap<String, Vec<RecordId>>,
    next_id: u64,
    last_created: Option<DateTime<Utc>>,
    journal: Option<File>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            records: BTreeMap::new(),
            by_hash: HashMap::new(),
            next_id: 1,
            last_created: None,
            journal: None,
        }
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Insert { record } => {
                self.next_id = self.next_id.max(record.id.0 + 1);
                self.last_created = self.last_created.max(Some(record.created_at));
                self.by_hash
                    .entry(record.content_hash.clone())
                    .or_default()
                    .push(record.id);
                self.records.insert(record.id, record);
            }
            JournalEntry::MarkDuplicate {
                id,
                canonical_id,
                canonical_path,
            } => {
                if let Some(rec) = self.records.get_mut(&id) {
                    rec.is_duplicate_of = Some(canonical_id);
                    rec.canonical_path = canonical_path;
                }
            }
        }
    }

    /// Appends to the journal, if there is one. Must succeed before the
    /// in-memory state changes.
    fn write(&mut self, entry: &JournalEntry) -> Result<(), StorageError> {
        if let Some(file) = self.journal.as_mut() {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
            file.sync_data()?;
        }
        Ok(())
    }
}

/// In-memory record store with an optional append-only JSON-lines journal.
///
/// All mutations happen under one write lock, which also orders ids and
/// timestamps: a record inserted later never has a smaller id or an
/// earlier `created_at` than one inserted before it.
pub struct MemoryRecordStore {
    inner: RwLock<Inner>,
}

impl MemoryRecordStore {
    /// A store that forgets everything on drop.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::empty()),
        }
    }

    /// Opens (or creates) a journal-backed store, replaying existing
    /// entries.
    ///
    /// A line that fails to parse is skipped with a warning; a crash while
    /// appending can leave the last line truncated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut inner = Inner::empty();
        let mut needs_newline = false;
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            for (n, line) in data.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(line) {
                    Ok(entry) => inner.apply(entry),
                    Err(e) => warn!(path = %path.display(), line = n + 1, error = %e, "skipping journal entry"),
                }
            }
            needs_newline = !data.is_empty() && !data.ends_with('\n');
            debug!(path = %path.display(), records = inner.records.len(), "replayed record journal");
        }

        let mut journal = OpenOptions::new().create(true).append(true).open(path)?;
        if needs_newline {
            // Keep the next entry off the truncated line.
            journal.write_all(b"\n")?;
        }
        inner.journal = Some(journal);
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn insert(&self, record: NewFileRecord) -> Result<FileRecord, StorageError> {
        let mut inner = self.inner.write();

        let id = RecordId(inner.next_id);
        let now = Utc::now();
        let created_at = match inner.last_created {
            Some(last) if last > now => last,
            _ => now,
        };
        let record = record.into_record(id, created_at);

        let entry = JournalEntry::Insert { record };
        inner.write(&entry)?;
        inner.apply(entry);

        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound(id))
    }

    fn get(&self, id: RecordId) -> Option<FileRecord> {
        self.inner.read().records.get(&id).cloned()
    }

    fn find_by_hash(&self, content_hash: &str) -> Vec<FileRecord> {
        let inner = self.inner.read();
        inner
            .by_hash
            .get(content_hash)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.records.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mark_duplicate(
        &self,
        id: RecordId,
        canonical: &FileRecord,
    ) -> Result<FileRecord, StorageError> {
        let mut inner = self.inner.write();
        if !inner.records.contains_key(&id) {
            return Err(StorageError::NotFound(id));
        }

        let entry = JournalEntry::MarkDuplicate {
            id,
            canonical_id: canonical.id,
            canonical_path: canonical.canonical_path.clone(),
        };
        inner.write(&entry)?;
        inner.apply(entry);

        inner.records.get(&id).cloned().ok_or(StorageError::NotFound(id))
    }

    fn len(&self) -> usize {
        self.inner.read().records.len()
    }
}
