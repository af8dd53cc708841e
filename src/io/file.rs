use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

struct FileInner {
    file: File,
    id: u64,
    path: PathBuf,
    size: AtomicU64,
}

/// Low-level positional file I/O. Clones share the same descriptor and
/// identity; the id is what the page cache hashes on.
#[derive(Clone)]
pub struct FileHandle {
    inner: Arc<FileInner>,
}

impl FileHandle {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<FileHandle> {
        let path = path.as_ref();
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(path)?,
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?,
        };
        let size = file.metadata()?.len();
        Ok(FileHandle {
            inner: Arc::new(FileInner {
                file,
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                path: path.to_path_buf(),
                size: AtomicU64::new(size),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Acquire)
    }

    /// Read exactly `buf.len()` bytes at `offset`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.inner.file.read_exact_at(buf, offset).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("pread {} @{}: {}", self.inner.path.display(), offset, e),
            )
        })
    }

    /// Read up to `buf.len()` bytes at `offset`; short reads at end of
    /// file return the number of bytes actually read.
    pub fn pread_some(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut read = 0;
        while read < buf.len() {
            match self.inner.file.read_at(&mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(Error::new(
                        ErrorKind::Io,
                        format!("pread {}: {}", self.inner.path.display(), e),
                    ))
                }
            }
        }
        Ok(read)
    }

    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.inner.file.write_all_at(buf, offset).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("pwrite {} @{}: {}", self.inner.path.display(), offset, e),
            )
        })?;
        let end = offset + buf.len() as u64;
        self.inner.size.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    /// Append at the current end of file, returning the offset written at.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        let offset = self.inner.size.fetch_add(buf.len() as u64, Ordering::AcqRel);
        self.inner.file.write_all_at(buf, offset).map_err(|e| {
            Error::new(
                ErrorKind::Io,
                format!("append {}: {}", self.inner.path.display(), e),
            )
        })?;
        Ok(offset)
    }

    pub fn truncate(&self, size: u64) -> Result<()> {
        self.inner.file.set_len(size)?;
        self.inner.size.store(size, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_io_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileHandle::open(dir.path().join("t"), OpenMode::ReadWrite).unwrap();

        file.pwrite(b"hello", 10).unwrap();
        assert_eq!(file.size(), 15);

        let mut buf = [0u8; 5];
        file.pread(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");

        let off = file.append(b"!").unwrap();
        assert_eq!(off, 15);

        file.truncate(4).unwrap();
        assert_eq!(file.size(), 4);
        assert!(file.pread(&mut buf, 0).is_err());
    }
}
