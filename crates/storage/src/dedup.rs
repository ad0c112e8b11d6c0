use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::record::{FileRecord, NewFileRecord, RecordId, select_canonical};
use crate::store::RecordStore;

/// Outcome of registering a record that expected to be canonical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// The new record is the canonical one for its hash.
    Canonical(FileRecord),
    /// Another record with the same hash was registered first. `own` has
    /// already been turned into a duplicate of `winner`; the caller must
    /// discard the bytes it placed for `own`.
    LostRace {
        own: FileRecord,
        winner: FileRecord,
    },
}

impl Registration {
    /// The record now describing this upload.
    pub fn record(&self) -> &FileRecord {
        match self {
            Self::Canonical(rec) => rec,
            Self::LostRace { own, .. } => own,
        }
    }
}

/// Content-hash lookups and canonical registration over a [`RecordStore`].
///
/// There is no lock spanning "look up, then register". Two uploads with
/// identical content may both find no canonical record and both register;
/// [`register_canonical`](Self::register_canonical) re-queries after its
/// insert and demotes whichever record loses the deterministic selection.
pub struct DedupIndex {
    store: Arc<dyn RecordStore>,
}

impl DedupIndex {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn get(&self, id: RecordId) -> Option<FileRecord> {
        self.store.get(id)
    }

    /// Every record with `content_hash`, canonical or not.
    pub fn find_by_hash(&self, content_hash: &str) -> Vec<FileRecord> {
        self.store.find_by_hash(content_hash)
    }

    /// The canonical record for `content_hash`, if any.
    pub fn canonical_for(&self, content_hash: &str) -> Option<FileRecord> {
        let matches = self.store.find_by_hash(content_hash);
        if matches.len() > 1 {
            debug!(hash = %content_hash, matches = matches.len(), "multiple records share a hash");
        }
        select_canonical(&matches).cloned()
    }

    /// Records a duplicate of `canonical`. The new record references the
    /// canonical bytes and owns none of its own.
    pub fn register_duplicate(
        &self,
        mut record: NewFileRecord,
        canonical: &FileRecord,
    ) -> Result<FileRecord, StorageError> {
        record.is_duplicate_of = Some(canonical.id);
        record.canonical_path = canonical.canonical_path.clone();
        self.store.insert(record)
    }

    /// Registers a record whose bytes are already at
    /// `record.canonical_path`, then reconciles against concurrent
    /// registrations of the same hash.
    ///
    /// An `Err` means nothing was committed. If the record was inserted
    /// but could not be demoted after losing a race, it is returned as
    /// [`Registration::Canonical`]; the hash then has two canonical
    /// records until reconciliation, and [`canonical_for`](Self::canonical_for)
    /// still picks the earlier one.
    pub fn register_canonical(
        &self,
        mut record: NewFileRecord,
    ) -> Result<Registration, StorageError> {
        record.is_duplicate_of = None;
        let own = self.store.insert(record)?;

        let matches = self.store.find_by_hash(&own.content_hash);
        let winner = match select_canonical(&matches) {
            Some(w) if w.id != own.id => w.clone(),
            _ => return Ok(Registration::Canonical(own)),
        };

        // `own` is committed and owns its bytes from here on, so a failed
        // demotion must not turn into an error that makes the caller
        // delete them.
        let own = match self.store.mark_duplicate(own.id, &winner) {
            Ok(own) => own,
            Err(e) => {
                warn!(
                    hash = %own.content_hash,
                    record_id = %own.id,
                    winner_id = %winner.id,
                    error = %e,
                    "could not demote losing record, keeping it canonical"
                );
                return Ok(Registration::Canonical(own));
            }
        };
        info!(
            hash = %own.content_hash,
            record_id = %own.id,
            winner_id = %winner.id,
            "resolved concurrent registration of identical content"
        );
        Ok(Registration::LostRace { own, winner })
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
