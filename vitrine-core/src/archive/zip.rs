use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use zip::ZipArchive;

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

use super::{is_image_entry, normalize_entry_name, ArchiveSource, EntryMeta};

/// ZIP container access. Each call re-opens the archive, so listings are
/// restartable and readers never borrow shared state.
#[derive(Debug, Clone)]
pub struct ZipSource {
    path: PathBuf,
    longpath: LongPath,
}

impl ZipSource {
    pub fn new(path: PathBuf, longpath: LongPath) -> Self {
        Self { path, longpath }
    }

    fn open_archive(&self) -> Result<ZipArchive<File>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let file = File::open(&path).map_err(CoreError::Io)?;
        ZipArchive::new(file).map_err(|err| {
            CoreError::ArchiveCorrupt(format!(
                "{}: {err}",
                self.path.display()
            ))
        })
    }
}

impl ArchiveSource for ZipSource {
    fn entries(&self) -> Result<Vec<EntryMeta>> {
        let mut archive = self.open_archive()?;
        let mut entries = Vec::new();
        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(|err| {
                CoreError::ArchiveCorrupt(format!(
                    "{}: entry {index}: {err}",
                    self.path.display()
                ))
            })?;
            if entry.is_dir() {
                continue;
            }
            let relative_path = normalize_entry_name(entry.name());
            if !is_image_entry(&relative_path) {
                continue;
            }
            entries.push(EntryMeta {
                relative_path,
                size_bytes: entry.size(),
            });
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }

    fn open(&self, entry: &EntryMeta) -> Result<Box<dyn Read + Send>> {
        let mut archive = self.open_archive()?;
        // Entry names were normalized during listing; scan for the match
        // instead of relying on by_name with the original separators.
        for index in 0..archive.len() {
            let mut file = archive.by_index(index).map_err(|err| {
                CoreError::ArchiveCorrupt(format!(
                    "{}: entry {index}: {err}",
                    self.path.display()
                ))
            })?;
            if normalize_entry_name(file.name()) != entry.relative_path {
                continue;
            }
            let mut bytes = Vec::with_capacity(entry.size_bytes as usize);
            file.read_to_end(&mut bytes).map_err(|err| {
                CoreError::ArchiveCorrupt(format!(
                    "{}: {}: {err}",
                    self.path.display(),
                    entry.relative_path
                ))
            })?;
            return Ok(Box::new(Cursor::new(bytes)));
        }
        Err(CoreError::NotFound(format!(
            "zip entry missing: {}",
            entry.relative_path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn build_zip(path: &std::path::Path) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = FileOptions::default();
        writer.start_file("one.jpg", options).unwrap();
        writer.write_all(b"first").unwrap();
        writer.start_file("notes.txt", options).unwrap();
        writer.write_all(b"skip me").unwrap();
        writer.start_file("nested/two.png", options).unwrap();
        writer.write_all(b"second").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn lists_and_reads_image_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("set.zip");
        build_zip(&zip_path);

        let source = ZipSource::new(zip_path, LongPath::default());
        let entries = source.entries().unwrap();
        let names: Vec<_> =
            entries.iter().map(|e| e.relative_path.as_str()).collect();
        assert_eq!(names, ["nested/two.png", "one.jpg"]);

        let mut reader = source.open(&entries[1]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"first");
    }

    #[test]
    fn corrupt_container_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.zip");
        std::fs::write(&bogus, b"not a zip at all").unwrap();

        let source = ZipSource::new(bogus, LongPath::default());
        assert!(matches!(
            source.entries(),
            Err(CoreError::ArchiveCorrupt(_))
        ));
    }
}
