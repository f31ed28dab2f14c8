//! In-memory [`Device`] backing an in-memory database.

use parking_lot::RwLock;

use crate::error::{Result, StorageError};

use super::Device;

/// A device backed by a growable in-memory buffer. Never touches disk;
/// used for `Config::in_memory()` environments.
pub struct MemoryDevice {
    buf: RwLock<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self {
            buf: RwLock::new(Vec::new()),
        }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MemoryDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.buf.read();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .ok_or_else(|| StorageError::invalid_parameter("read range overflow"))?;
        if end > data.len() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory device",
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.buf.write();
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut data = self.buf.write();
        data.resize(len as usize, 0);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.buf.read().len() as u64)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_on_write_past_end() {
        let dev = MemoryDevice::new();
        dev.write(100, b"abc").unwrap();
        assert_eq!(dev.size().unwrap(), 103);
        let mut buf = [0u8; 3];
        dev.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }
}
