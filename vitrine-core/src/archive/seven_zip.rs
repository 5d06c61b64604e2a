use std::io::{Cursor, Read};
use std::path::PathBuf;

use sevenz_rust::{Password, SevenZReader};

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

use super::{is_image_entry, normalize_entry_name, ArchiveSource, EntryMeta};

/// 7z container access. 7z archives may use solid blocks, so entry access
/// decompresses sequentially up to the requested file.
#[derive(Debug, Clone)]
pub struct SevenZipSource {
    path: PathBuf,
    longpath: LongPath,
}

impl SevenZipSource {
    pub fn new(path: PathBuf, longpath: LongPath) -> Self {
        Self { path, longpath }
    }

    fn corrupt(&self, err: impl std::fmt::Display) -> CoreError {
        CoreError::ArchiveCorrupt(format!("{}: {err}", self.path.display()))
    }
}

impl ArchiveSource for SevenZipSource {
    fn entries(&self) -> Result<Vec<EntryMeta>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let mut reader = SevenZReader::open(&path, Password::empty())
            .map_err(|e| self.corrupt(e))?;
        let mut entries = Vec::new();
        reader
            .for_each_entries(|entry, _reader| {
                if !entry.is_directory() {
                    let relative_path = normalize_entry_name(entry.name());
                    if is_image_entry(&relative_path) {
                        entries.push(EntryMeta {
                            relative_path,
                            size_bytes: entry.size(),
                        });
                    }
                }
                Ok(true)
            })
            .map_err(|e| self.corrupt(e))?;
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(entries)
    }

    fn open(&self, wanted: &EntryMeta) -> Result<Box<dyn Read + Send>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let mut reader = SevenZReader::open(&path, Password::empty())
            .map_err(|e| self.corrupt(e))?;
        let mut found: Option<std::io::Result<Vec<u8>>> = None;
        let target = wanted.relative_path.clone();
        reader
            .for_each_entries(|entry, entry_reader| {
                if entry.is_directory()
                    || normalize_entry_name(entry.name()) != target
                {
                    return Ok(true);
                }
                let mut bytes = Vec::with_capacity(entry.size() as usize);
                found =
                    Some(entry_reader.read_to_end(&mut bytes).map(|_| bytes));
                // Stop iterating once the entry is extracted.
                Ok(false)
            })
            .map_err(|e| self.corrupt(e))?;
        match found {
            Some(Ok(bytes)) => Ok(Box::new(Cursor::new(bytes))),
            Some(Err(err)) => Err(self.corrupt(err)),
            None => Err(CoreError::NotFound(format!(
                "7z entry missing: {}",
                wanted.relative_path
            ))),
        }
    }
}
