//! File drivers
//!
//! The allocator and the cache only ever address the file through
//! [`FileDriver`]. Reads past the physical end of the file yield zeros, since
//! the end of allocation may run ahead of what has been written.

use metacache_common::{Error, Result};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Positional I/O on the underlying file
pub trait FileDriver: Send + Sync {
    /// Fill `buf` from `offset`; bytes past the physical end read as zero
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Physical length of the file
    fn len(&self) -> Result<u64>;

    /// Truncate or extend the file
    fn set_len(&self, len: u64) -> Result<()>;

    /// Whether the file has no bytes
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Flush written data to stable storage
    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory driver.
///
/// Clones share the same buffer, so a clone handed to a second file context
/// sees everything the first one wrote.
#[derive(Clone, Debug, Default)]
pub struct MemDriver {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemDriver {
    /// Create an empty in-memory file
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current contents
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl FileDriver for MemDriver {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        buf.fill(0);
        let Ok(start) = usize::try_from(offset) else {
            return Ok(());
        };
        if start < data.len() {
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| Error::invalid_argument(format!("offset {offset:#x} too large")))?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            Error::invalid_argument(format!("write of {} bytes at {offset:#x} overflows", buf.len()))
        })?;
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| Error::invalid_argument(format!("length {len:#x} too large")))?;
        self.data.write().resize(len, 0);
        Ok(())
    }
}

/// Driver over a regular file
#[derive(Debug)]
pub struct DiskDriver {
    file: File,
    path: String,
    read_only: bool,
}

impl DiskDriver {
    /// Create (or truncate) a file
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            file,
            path: path_str,
            read_only: false,
        })
    }

    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        Ok(Self {
            file,
            path: path_str,
            read_only,
        })
    }

    /// Get the file path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl FileDriver for DiskDriver {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                buf[done..].fill(0);
                break;
            }
            done += n;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid_argument(format!("{} is read-only", self.path)));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid_argument(format!("{} is read-only", self.path)));
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mem_driver_read_past_end() {
        let driver = MemDriver::new();
        driver.write_at(4, b"abcd").unwrap();
        assert_eq!(driver.len().unwrap(), 8);

        let mut buf = [0xffu8; 10];
        driver.read_at(2, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, b'a', b'b', b'c', b'd', 0, 0, 0, 0]);
    }

    #[test]
    fn test_mem_driver_rejects_overflowing_write() {
        let driver = MemDriver::new();
        assert!(matches!(
            driver.write_at(u64::MAX - 2, b"overflow"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(driver.len().unwrap(), 0);
    }

    #[test]
    fn test_mem_driver_clone_shares_data() {
        let driver = MemDriver::new();
        let other = driver.clone();
        driver.write_at(0, b"shared").unwrap();
        assert_eq!(other.snapshot(), b"shared");
        other.set_len(3).unwrap();
        assert_eq!(driver.len().unwrap(), 3);
    }

    #[test]
    fn test_disk_driver_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.mc");

        let driver = DiskDriver::create(&path).unwrap();
        driver.write_at(100, b"hello").unwrap();
        driver.sync().unwrap();
        assert_eq!(driver.len().unwrap(), 105);
        drop(driver);

        let driver = DiskDriver::open(&path, true).unwrap();
        let mut buf = [0u8; 8];
        driver.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello\0\0\0");
        assert!(driver.write_at(0, b"x").is_err());
    }
}
