use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use tracing::warn;
use walkdir::WalkDir;

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

use super::{is_image_entry, ArchiveSource, EntryMeta};

/// Recursive directory traversal presented as a flat entry list. Entry
/// opens resolve through the long-path adapter, so nested files whose
/// combined path exceeds the safe limit still read back.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
    longpath: LongPath,
}

impl FolderSource {
    pub fn new(root: PathBuf, longpath: LongPath) -> Self {
        Self { root, longpath }
    }
}

impl ArchiveSource for FolderSource {
    fn entries(&self) -> Result<Vec<EntryMeta>> {
        if !self.root.is_dir() {
            return Err(CoreError::NotFound(format!(
                "collection folder missing: {}",
                self.root.display()
            )));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("directory walk error under {}: {err}", self.root.display());
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let relative_path = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !is_image_entry(&relative_path) {
                continue;
            }
            let size_bytes =
                entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(EntryMeta {
                relative_path,
                size_bytes,
            });
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }

    fn open(&self, entry: &EntryMeta) -> Result<Box<dyn Read + Send>> {
        let path = self
            .longpath
            .resolve_read(&self.root.join(&entry.relative_path))?;
        let file = File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound(format!(
                    "entry vanished: {}",
                    entry.relative_path
                ))
            } else {
                err.into()
            }
        })?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn lists_nested_images_and_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.jpg"), b"jpg").unwrap();
        fs::write(dir.path().join("sub/b.png"), b"png!").unwrap();
        fs::write(dir.path().join("c.txt"), b"text").unwrap();

        let source = FolderSource::new(
            dir.path().to_path_buf(),
            LongPath::default(),
        );
        let entries = source.entries().unwrap();
        let names: Vec<_> =
            entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(names, ["a.jpg", "sub/b.png"]);
        assert_eq!(entries[1].size_bytes, 4);

        // Restartable: a second listing sees the same entries.
        assert_eq!(source.entries().unwrap(), entries);

        let mut reader = source.open(&entries[0]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"jpg");
    }

    #[test]
    fn missing_root_is_not_found() {
        let source = FolderSource::new(
            PathBuf::from("/nonexistent/path"),
            LongPath::default(),
        );
        assert!(matches!(
            source.entries(),
            Err(CoreError::NotFound(_))
        ));
    }
}
