use std::fs::File;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

use super::{is_image_entry, normalize_entry_name, ArchiveSource, EntryMeta};

/// Compression wrapper around a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
}

/// Tar container access, optionally gzip- or bzip2-compressed. Tar has no
/// central directory, so both listing and per-entry open are forward scans.
#[derive(Debug, Clone)]
pub struct TarSource {
    path: PathBuf,
    compression: TarCompression,
    longpath: LongPath,
}

impl TarSource {
    pub fn new(
        path: PathBuf,
        compression: TarCompression,
        longpath: LongPath,
    ) -> Self {
        Self {
            path,
            compression,
            longpath,
        }
    }

    fn open_stream(&self) -> Result<Box<dyn Read>> {
        let path = self.longpath.resolve_read(&self.path)?;
        let file = File::open(&path).map_err(CoreError::Io)?;
        Ok(match self.compression {
            TarCompression::None => Box::new(file),
            TarCompression::Gzip => Box::new(GzDecoder::new(file)),
            TarCompression::Bzip2 => Box::new(BzDecoder::new(file)),
        })
    }

    fn corrupt(&self, err: impl std::fmt::Display) -> CoreError {
        CoreError::ArchiveCorrupt(format!("{}: {err}", self.path.display()))
    }
}

impl ArchiveSource for TarSource {
    fn entries(&self) -> Result<Vec<EntryMeta>> {
        let mut archive = tar::Archive::new(self.open_stream()?);
        let mut entries = Vec::new();
        for entry in archive.entries().map_err(|e| self.corrupt(e))? {
            let entry = entry.map_err(|e| self.corrupt(e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|e| self.corrupt(e))?;
            let relative_path =
                normalize_entry_name(&path.to_string_lossy());
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

    fn open(&self, wanted: &EntryMeta) -> Result<Box<dyn Read + Send>> {
        let mut archive = tar::Archive::new(self.open_stream()?);
        for entry in archive.entries().map_err(|e| self.corrupt(e))? {
            let mut entry = entry.map_err(|e| self.corrupt(e))?;
            let path = entry.path().map_err(|e| self.corrupt(e))?;
            let relative_path =
                normalize_entry_name(&path.to_string_lossy());
            if relative_path != wanted.relative_path {
                continue;
            }
            let mut bytes =
                Vec::with_capacity(wanted.size_bytes as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|e| self.corrupt(e))?;
            return Ok(Box::new(Cursor::new(bytes)));
        }
        Err(CoreError::NotFound(format!(
            "tar entry missing: {}",
            wanted.relative_path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tar(path: &std::path::Path) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_cksum();
        builder
            .append_data(&mut header, "img/a.gif", &b"pixel"[..])
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_cksum();
        builder
            .append_data(&mut header, "doc.pdf", &b"skip"[..])
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn plain_tar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("set.tar");
        build_tar(&tar_path);

        let source = TarSource::new(
            tar_path,
            TarCompression::None,
            LongPath::default(),
        );
        let entries = source.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].relative_path, "img/a.gif");

        let mut reader = source.open(&entries[0]).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"pixel");
    }

    #[test]
    fn truncated_tar_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar");
        std::fs::write(&path, vec![0x42; 100]).unwrap();

        let source = TarSource::new(
            path,
            TarCompression::None,
            LongPath::default(),
        );
        assert!(source.entries().is_err());
    }
}
