//! Read-only file source backed by a memory mapping.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use memmap2::Mmap;
use tracing::debug;

/// A model file opened for analysis. Empty files are not mapped.
pub struct MappedFile {
    path: PathBuf,
    map: Option<Mmap>,
    len: u64,
}

impl MappedFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let meta = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if !meta.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let len = meta.len();

        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and lives no longer than `self`;
            // concurrent truncation by another process is outside our control.
            Some(unsafe { Mmap::map(&file) }.with_context(|| format!("failed to map {}", path.display()))?)
        };
        debug!(path = %path.display(), len, "model file mapped");
        Ok(Self {
            path: path.to_path_buf(),
            map,
            len,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Size reported by the file system when the file was opened.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"GGUF\x03\0\0\0").unwrap();
        f.flush().unwrap();
        let m = MappedFile::open(f.path()).unwrap();
        assert_eq!(m.len(), 8);
        assert_eq!(m.bytes(), b"GGUF\x03\0\0\0");
        assert_eq!(m.path(), f.path());
    }

    #[test]
    fn empty_file_is_not_mapped() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let m = MappedFile::open(f.path()).unwrap();
        assert_eq!(m.len(), 0);
        assert!(m.bytes().is_empty());
    }

    #[test]
    fn missing_file_and_directory_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MappedFile::open(&dir.path().join("nope.gguf")).is_err());
        assert!(MappedFile::open(dir.path()).is_err());
    }
}
