use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chatdrop_transfer::{AssembledFile, sanitize_file_name, split_extension};
use rand::Rng;
use tracing::{debug, warn};

use crate::category::StorageCategory;
use crate::error::StorageError;
use crate::record::RecordId;

/// Directory under the storage root that holds files being assembled.
const INCOMING_DIR: &str = ".incoming";

/// Random bytes in a generated file name (8 hex characters).
const SHORT_ID_BYTES: usize = 4;

/// Attempts at finding a free name before giving up.
const MAX_NAME_ATTEMPTS: usize = 8;

/// Where a promoted file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedFile {
    pub path: PathBuf,
    pub category: StorageCategory,
}

/// Lays files out as `{root}/{category}/{timestamp}-{name}-{id}.{ext}`.
#[derive(Debug, Clone)]
pub struct StoragePlacer {
    root: PathBuf,
    download_prefix: String,
}

impl StoragePlacer {
    pub fn new(root: impl Into<PathBuf>, download_prefix: impl Into<String>) -> Self {
        let prefix = download_prefix.into();
        Self {
            root: root.into(),
            download_prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Temporary directory for assembly; on the same filesystem as the
    /// category directories so promotion is a rename.
    pub fn incoming_dir(&self) -> PathBuf {
        self.root.join(INCOMING_DIR)
    }

    /// Download reference handed to clients for a record.
    pub fn download_path(&self, id: RecordId) -> String {
        format!("{}/{}", self.download_prefix, id)
    }

    /// Builds a fresh on-disk file name for an upload.
    ///
    /// The extension comes from the original name, else the content
    /// subtype, else `bin`.
    pub fn generate_file_name(original_name: &str, content_type: &str) -> String {
        let (stem, ext) = split_extension(original_name);
        let ext = ext
            .or_else(|| subtype_extension(content_type))
            .map(|e| sanitize_file_name(&e))
            .unwrap_or_else(|| "bin".to_string());

        let mut bytes = [0u8; SHORT_ID_BYTES];
        rand::thread_rng().fill(&mut bytes);

        format!(
            "{}-{}-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            sanitize_file_name(stem),
            hex::encode(bytes),
            ext
        )
    }

    /// Moves an assembled file to its final location.
    ///
    /// Never overwrites: if a generated name is taken a new one is tried.
    /// On error the temporary file is dropped, which removes it.
    pub fn promote(
        &self,
        file: AssembledFile,
        original_name: &str,
        content_type: &str,
    ) -> Result<PlacedFile, StorageError> {
        let category = StorageCategory::from_content_type(content_type);
        let dir = self.root.join(category.dir_name());
        std::fs::create_dir_all(&dir)?;

        let mut temp = file.temp;
        let mut last = dir.clone();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let path = dir.join(Self::generate_file_name(original_name, content_type));
            match temp.persist_noclobber(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), %category, "promoted upload");
                    return Ok(PlacedFile { path, category });
                }
                Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                    warn!(path = %path.display(), "generated file name already taken");
                    temp = e.file;
                    last = path;
                }
                Err(e) => return Err(StorageError::Io(e.error)),
            }
        }
        Err(StorageError::Collision(last))
    }

    /// Removes a promoted file. A file that is already gone is not an
    /// error.
    pub fn discard(&self, path: &Path) -> Result<(), StorageError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), "discarded file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `video/mp4` gives `mp4`, `image/svg+xml` gives `svg`.
fn subtype_extension(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim();
    let (_, subtype) = essence.split_once('/')?;
    let subtype = subtype.split('+').next()?.trim().to_ascii_lowercase();
    if subtype.is_empty() || subtype == "octet-stream" {
        None
    } else {
        Some(subtype)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chatdrop_transfer::Assembler;

    use super::*;

    fn assembled(placer: &StoragePlacer, data: &[u8]) -> AssembledFile {
        Assembler::new(placer.incoming_dir())
            .assemble(vec![data.to_vec()], data.len() as u64)
            .unwrap()
    }

    #[test]
    fn file_name_shape() {
        let name = StoragePlacer::generate_file_name("My Video.MP4", "video/mp4");
        let parts: Vec<_> = name.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<i64>().is_ok(), "timestamp prefix in {name}");
        assert!(name.contains("-My_Video-"), "sanitized stem in {name}");
        assert!(name.ends_with(".mp4"));

        let short_id = name
            .trim_end_matches(".mp4")
            .rsplit('-')
            .next()
            .unwrap();
        assert_eq!(short_id.len(), 8);
        assert!(short_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn extension_fallbacks() {
        assert!(StoragePlacer::generate_file_name("clip", "video/webm").ends_with(".webm"));
        assert!(StoragePlacer::generate_file_name("logo", "image/svg+xml").ends_with(".svg"));
        assert!(
            StoragePlacer::generate_file_name("blob", "application/octet-stream").ends_with(".bin")
        );
    }

    #[test]
    fn identical_names_never_collide() {
        let names: HashSet<_> = (0..200)
            .map(|_| StoragePlacer::generate_file_name("same.png", "image/png"))
            .collect();
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn promote_moves_into_category_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let placer = StoragePlacer::new(tmp.path(), "/files/");

        let file = assembled(&placer, b"pixels");
        let temp_path = file.path().to_path_buf();
        let placed = placer.promote(file, "cat.png", "image/png").unwrap();

        assert_eq!(placed.category, StorageCategory::Images);
        assert_eq!(placed.path.parent().unwrap(), tmp.path().join("images"));
        assert_eq!(std::fs::read(&placed.path).unwrap(), b"pixels");
        assert!(!temp_path.exists());
    }

    #[test]
    fn discard_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let placer = StoragePlacer::new(tmp.path(), "/files");
        let placed = placer
            .promote(assembled(&placer, b"x"), "a.txt", "text/plain")
            .unwrap();

        placer.discard(&placed.path).unwrap();
        assert!(!placed.path.exists());
        placer.discard(&placed.path).unwrap();
    }

    #[test]
    fn download_path_uses_prefix() {
        let placer = StoragePlacer::new("/srv", "/files/");
        assert_eq!(placer.download_path(RecordId(12)), "/files/12");
    }
}
