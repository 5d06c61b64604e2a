use std::io::{Cursor, Read};
use std::path::PathBuf;

use unrar::Archive;

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

use super::{is_image_entry, normalize_entry_name, ArchiveSource, EntryMeta};

/// RAR container access via the bundled unrar library. The cursor-style
/// processing API walks headers in order; reads happen in place.
#[derive(Debug, Clone)]
pub struct RarSource {
    path: PathBuf,
    longpath: LongPath,
}

impl RarSource {
    pub fn new(path: PathBuf, longpath: LongPath) -> Self {
        Self { path, longpath }
    }

    fn corrupt(&self, err: impl std::fmt::Debug) -> CoreError {
        CoreError::ArchiveCorrupt(format!(
            "{}: {err:?}",
            self.path.display()
        ))
    }
}

impl ArchiveSource for RarSource {
    fn entries(&self) -> Result<Vec<EntryMeta>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let archive = Archive::new(&path)
            .open_for_listing()
            .map_err(|e| self.corrupt(e))?;
        let mut entries = Vec::new();
        for header in archive {
            let header = header.map_err(|e| self.corrupt(e))?;
            if !header.is_file() {
                continue;
            }
            let relative_path =
                normalize_entry_name(&header.filename.to_string_lossy());
            if !is_image_entry(&relative_path) {
                continue;
            }
            entries.push(EntryMeta {
                relative_path,
                size_bytes: header.unpacked_size as u64,
            });
        }
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }

    fn open(&self, wanted: &EntryMeta) -> Result<Box<dyn Read + Send>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let mut archive = Archive::new(&path)
            .open_for_processing()
            .map_err(|e| self.corrupt(e))?;
        loop {
            let header = match archive.read_header() {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(e) => return Err(self.corrupt(e)),
            };
            let matches = header.entry().is_file()
                && normalize_entry_name(
                    &header.entry().filename.to_string_lossy(),
                ) == wanted.relative_path;
            if matches {
                let (bytes, _rest) =
                    header.read().map_err(|e| self.corrupt(e))?;
                return Ok(Box::new(Cursor::new(bytes)));
            }
            archive = header.skip().map_err(|e| self.corrupt(e))?;
        }
        Err(CoreError::NotFound(format!(
            "rar entry missing: {}",
            wanted.relative_path
        )))
    }
}
