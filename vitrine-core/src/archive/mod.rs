//! Uniform "list + open entry" access over collection containers.
//!
//! A [`ArchiveSource`] presents any [`CollectionKind`] as a restartable
//! sequence of image entries plus a per-entry byte reader. Folder
//! collections traverse recursively; archive kinds are flat per their native
//! semantics. Entries whose extension is not in [`IMAGE_EXTENSIONS`] are
//! skipped silently at listing time.
//!
//! Readers guarantee sequential access only. Archive backends decompress the
//! requested entry into memory and hand back a cursor; the sizes involved
//! are single images, not whole containers.

mod folder;
mod rar;
mod seven_zip;
mod tar;
mod zip;

use std::io::Read;
use std::path::Path;

pub use folder::FolderSource;
pub use rar::RarSource;
pub use seven_zip::SevenZipSource;
pub use tar::{TarCompression, TarSource};
pub use zip::ZipSource;

use vitrine_model::CollectionKind;

use crate::error::Result;
use crate::longpath::LongPath;

/// Extensions recognized as images, lowercased.
pub const IMAGE_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "gif", "bmp", "webp", "tiff", "svg"];

/// One image entry inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMeta {
    /// `/`-separated path relative to the container root.
    pub relative_path: String,
    pub size_bytes: u64,
}

/// Lazy, restartable access to a collection's image entries.
pub trait ArchiveSource: Send + Sync {
    /// List image entries. Callable repeatedly; each call re-reads the
    /// container so the sequence is restartable.
    fn entries(&self) -> Result<Vec<EntryMeta>>;

    /// Open one entry for sequential reading. The reader is released by
    /// dropping it.
    fn open(&self, entry: &EntryMeta) -> Result<Box<dyn Read + Send>>;
}

/// Build the source matching a collection's container kind. Every open the
/// source performs routes through the long-path adapter.
pub fn open_source(
    kind: CollectionKind,
    path: &Path,
    longpath: LongPath,
) -> Box<dyn ArchiveSource> {
    match kind {
        CollectionKind::Folder => {
            Box::new(FolderSource::new(path.to_path_buf(), longpath))
        }
        CollectionKind::Zip => {
            Box::new(ZipSource::new(path.to_path_buf(), longpath))
        }
        CollectionKind::SevenZip => {
            Box::new(SevenZipSource::new(path.to_path_buf(), longpath))
        }
        CollectionKind::Rar => {
            Box::new(RarSource::new(path.to_path_buf(), longpath))
        }
        CollectionKind::Tar => Box::new(TarSource::new(
            path.to_path_buf(),
            TarCompression::None,
            longpath,
        )),
        CollectionKind::TarGz => Box::new(TarSource::new(
            path.to_path_buf(),
            TarCompression::Gzip,
            longpath,
        )),
        CollectionKind::TarBz2 => Box::new(TarSource::new(
            path.to_path_buf(),
            TarCompression::Bzip2,
            longpath,
        )),
    }
}

/// Whether a relative path names a supported image.
pub fn is_image_entry(relative_path: &str) -> bool {
    relative_path
        .rsplit('.')
        .next()
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.iter().any(|known| *known == ext)
        })
        .unwrap_or(false)
}

/// Normalize a container-native entry name to the canonical relative form:
/// `/` separators, no leading `./`.
pub(crate) fn normalize_entry_name(name: &str) -> String {
    let name = name.replace('\\', "/");
    name.strip_prefix("./").unwrap_or(&name).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_extension_filter_is_case_insensitive() {
        assert!(is_image_entry("a/b/photo.JPG"));
        assert!(is_image_entry("cover.webp"));
        assert!(!is_image_entry("readme.txt"));
        assert!(!is_image_entry("no_extension"));
    }

    #[test]
    fn entry_names_normalize_to_forward_slashes() {
        assert_eq!(normalize_entry_name("dir\\img.png"), "dir/img.png");
        assert_eq!(normalize_entry_name("./img.png"), "img.png");
    }
}
