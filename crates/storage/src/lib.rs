//! Where assembled uploads end up, and how identical content is shared.
//!
//! [`StoragePlacer`] moves assembled files into category directories under
//! the storage root. [`RecordStore`] keeps one [`FileRecord`] per upload and
//! [`DedupIndex`] decides, per content hash, which record is canonical.

mod category;
mod dedup;
mod error;
mod placer;
mod record;
mod store;

pub use category::StorageCategory;
pub use dedup::{DedupIndex, Registration};
pub use error::StorageError;
pub use placer::{PlacedFile, StoragePlacer};
pub use record::{FileRecord, NewFileRecord, RecordId, select_canonical};
pub use store::{MemoryRecordStore, RecordStore};
