use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::EncodeFormat;
use crate::ids::CollectionId;

/// The container kind a collection is backed by. Fixed at creation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    Folder,
    Zip,
    SevenZip,
    Rar,
    Tar,
    TarGz,
    TarBz2,
}

impl CollectionKind {
    /// Infer the collection kind from a path: directories become folder
    /// collections, known archive extensions map to their container kind.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Folder);
        }
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            return Some(Self::TarGz);
        }
        if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
            return Some(Self::TarBz2);
        }
        match name.rsplit('.').next()? {
            "zip" | "cbz" => Some(Self::Zip),
            "7z" | "cb7" => Some(Self::SevenZip),
            "rar" | "cbr" => Some(Self::Rar),
            "tar" => Some(Self::Tar),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Zip => "zip",
            Self::SevenZip => "seven_zip",
            Self::Rar => "rar",
            Self::Tar => "tar",
            Self::TarGz => "tar_gz",
            Self::TarBz2 => "tar_bz2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "folder" => Some(Self::Folder),
            "zip" => Some(Self::Zip),
            "seven_zip" => Some(Self::SevenZip),
            "rar" => Some(Self::Rar),
            "tar" => Some(Self::Tar),
            "tar_gz" => Some(Self::TarGz),
            "tar_bz2" => Some(Self::TarBz2),
            _ => None,
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour knobs attached to a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    /// Enqueue a scan job right after the collection is created.
    pub auto_scan: bool,
    /// Produce thumbnail artifacts during scans.
    pub generate_thumbnails: bool,
    /// Produce resized cache artifacts during scans.
    pub generate_cache: bool,
    /// Target pixel box for thumbnails (fit inside, never enlarged).
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    /// Target pixel box for cache variants.
    pub cache_width: u32,
    pub cache_height: u32,
    /// Encoder quality, clamped to 1..=100.
    pub quality: u8,
    /// Output codec for cache variants.
    pub cache_format: EncodeFormat,
    /// TTL applied to derived artifacts, in seconds. `None` means no expiry.
    pub cache_expiration_secs: Option<u64>,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            auto_scan: true,
            generate_thumbnails: true,
            generate_cache: false,
            thumbnail_width: 300,
            thumbnail_height: 300,
            cache_width: 1920,
            cache_height: 1080,
            quality: 85,
            cache_format: EncodeFormat::Jpeg,
            cache_expiration_secs: None,
        }
    }
}

impl CollectionSettings {
    pub fn clamped_quality(&self) -> u8 {
        self.quality.clamp(1, 100)
    }
}

/// Denormalized counters refreshed after each completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionStats {
    pub image_count: u64,
    pub total_size_bytes: u64,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

/// A named source of images backed by a folder or archive file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub path: PathBuf,
    pub kind: CollectionKind,
    pub settings: CollectionSettings,
    pub stats: CollectionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Images and artifacts remain until a purge runs.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        path: PathBuf,
        kind: CollectionKind,
        settings: CollectionSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: CollectionId::new(),
            name: name.into(),
            path,
            kind,
            settings,
            stats: CollectionStats::default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn kind_from_archive_extensions() {
        assert_eq!(
            CollectionKind::from_path(Path::new("a/b/set.zip")),
            Some(CollectionKind::Zip)
        );
        assert_eq!(
            CollectionKind::from_path(Path::new("scans.tar.gz")),
            Some(CollectionKind::TarGz)
        );
        assert_eq!(
            CollectionKind::from_path(Path::new("scans.tbz2")),
            Some(CollectionKind::TarBz2)
        );
        assert_eq!(
            CollectionKind::from_path(Path::new("vol1.cbr")),
            Some(CollectionKind::Rar)
        );
        assert_eq!(CollectionKind::from_path(Path::new("notes.txt")), None);
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            CollectionKind::Folder,
            CollectionKind::Zip,
            CollectionKind::SevenZip,
            CollectionKind::Rar,
            CollectionKind::Tar,
            CollectionKind::TarGz,
            CollectionKind::TarBz2,
        ] {
            assert_eq!(CollectionKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn default_settings_enable_thumbnails_only() {
        let settings = CollectionSettings::default();
        assert!(settings.generate_thumbnails);
        assert!(!settings.generate_cache);
        assert_eq!(settings.thumbnail_width, 300);
        assert_eq!(settings.clamped_quality(), 85);
    }
}
