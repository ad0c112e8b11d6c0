use serde::{Deserialize, Serialize};

/// Top-level directory an attachment is stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageCategory {
    Images,
    Audio,
    Video,
    Documents,
    Other,
}

impl StorageCategory {
    /// Picks the category for a declared content type.
    ///
    /// Parameters (`; charset=...`) and case are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence.starts_with("image/") {
            Self::Images
        } else if essence.starts_with("audio/") {
            Self::Audio
        } else if essence.starts_with("video/") {
            Self::Video
        } else if essence == "application/pdf"
            || essence.starts_with("text/")
            || essence.contains("document")
        {
            Self::Documents
        } else {
            Self::Other
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Images => "images",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Documents => "documents",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_types() {
        assert_eq!(StorageCategory::from_content_type("image/png"), StorageCategory::Images);
        assert_eq!(StorageCategory::from_content_type("audio/ogg"), StorageCategory::Audio);
        assert_eq!(StorageCategory::from_content_type("video/mp4"), StorageCategory::Video);
    }

    #[test]
    fn document_types() {
        assert_eq!(
            StorageCategory::from_content_type("application/pdf"),
            StorageCategory::Documents
        );
        assert_eq!(
            StorageCategory::from_content_type("text/plain; charset=utf-8"),
            StorageCategory::Documents
        );
        assert_eq!(
            StorageCategory::from_content_type(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            ),
            StorageCategory::Documents
        );
    }

    #[test]
    fn case_insensitive() {
        assert_eq!(StorageCategory::from_content_type("Video/MP4"), StorageCategory::Video);
    }

    #[test]
    fn everything_else_is_other() {
        assert_eq!(StorageCategory::from_content_type("application/zip"), StorageCategory::Other);
        assert_eq!(StorageCategory::from_content_type(""), StorageCategory::Other);
    }

    #[test]
    fn serde_and_display_agree() {
        let json = serde_json::to_string(&StorageCategory::Documents).unwrap();
        assert_eq!(json, "\"documents\"");
        assert_eq!(StorageCategory::Documents.to_string(), "documents");
    }
}
