//! File-backed [`Device`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::RwLock;

use crate::error::Result;

use super::Device;

/// A device backed by a single file, opened for read/write.
pub struct FileDevice {
    file: RwLock<File>,
}

impl FileDevice {
    /// Opens `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: RwLock::new(file),
        })
    }
}

impl Device for FileDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let file = self.file.write();
        file.set_len(len)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.read();
        Ok(file.metadata()?.len())
    }

    fn flush(&self) -> Result<()> {
        let mut file = self.file.write();
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("dev.bin")).unwrap();
        dev.truncate(4096).unwrap();
        dev.write(128, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        dev.read(128, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn size_reflects_truncate() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("dev.bin")).unwrap();
        dev.truncate(8192).unwrap();
        assert_eq!(dev.size().unwrap(), 8192);
    }
}
