use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CollectionId, ImageId};

/// A logical image entry inside a collection.
///
/// `(collection_id, relative_path)` is unique among the images of a
/// collection; the relative path uses `/` separators regardless of the
/// host platform so archive entries and folder files address identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub collection_id: CollectionId,
    pub filename: String,
    pub relative_path: String,
    pub file_size_bytes: u64,
    pub width: u32,
    pub height: u32,
    /// Source format, lowercased (`jpeg`, `png`, ...).
    pub format: String,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(
        collection_id: CollectionId,
        relative_path: impl Into<String>,
        file_size_bytes: u64,
        width: u32,
        height: u32,
        format: impl Into<String>,
    ) -> Self {
        let relative_path = relative_path.into();
        let filename = relative_path
            .rsplit('/')
            .next()
            .unwrap_or(relative_path.as_str())
            .to_string();
        Self {
            id: ImageId::new(),
            collection_id,
            filename,
            relative_path,
            file_size_bytes,
            width,
            height,
            format: format.into().to_ascii_lowercase(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_last_path_segment() {
        let record = ImageRecord::new(
            CollectionId::new(),
            "nested/dir/photo.JPG",
            10,
            800,
            600,
            "JPEG",
        );
        assert_eq!(record.filename, "photo.JPG");
        assert_eq!(record.format, "jpeg");
    }
}
