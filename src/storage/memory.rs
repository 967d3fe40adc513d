//! # In-Memory Backing File
//!
//! `MemoryFile` keeps the database image in a shared byte vector. Clones of a
//! `MemoryFile` refer to the same image, so a test can keep one handle, drop an
//! engine without closing it, and reopen from the bytes that actually reached
//! "disk".
//!
//! ## Crash Simulation
//!
//! ```text
//! limit_writes(Some(n))
//!     write_page #1 .. #n   -> applied
//!     write_page #n+1 ..    -> silently dropped (power lost)
//! ```
//!
//! Dropped writes report success, exactly like a write that was buffered by
//! the OS and then lost. `page_writes()` counts every write request so a test
//! can sweep the cut point over a whole commit.

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use super::file::StorageFile;
use crate::config::PAGE_SIZE;

#[derive(Debug, Default)]
struct MemoryImage {
    bytes: Vec<u8>,
    writes_left: Option<usize>,
    page_writes: u64,
    syncs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    image: Arc<Mutex<MemoryImage>>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            image: Arc::new(Mutex::new(MemoryImage {
                bytes,
                ..MemoryImage::default()
            })),
        }
    }

    /// Copy of the bytes written so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().bytes.clone()
    }

    /// Applies at most `limit` further page writes; `None` lifts the limit.
    pub fn limit_writes(&self, limit: Option<usize>) {
        self.image.lock().writes_left = limit;
    }

    /// Number of page write requests issued, applied or not.
    pub fn page_writes(&self) -> u64 {
        self.image.lock().page_writes
    }

    pub fn syncs(&self) -> u64 {
        self.image.lock().syncs
    }

    /// Overwrites raw bytes, bypassing the write limit.
    pub fn patch(&self, pos: usize, bytes: &[u8]) {
        let mut image = self.image.lock();
        let end = pos + bytes.len();
        if image.bytes.len() < end {
            image.bytes.resize(end, 0);
        }
        image.bytes[pos..end].copy_from_slice(bytes);
    }
}

impl StorageFile for MemoryFile {
    fn read_page(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let image = self.image.lock();
        let start = pos as usize;
        buf.fill(0);
        if start < image.bytes.len() {
            let end = (start + buf.len()).min(image.bytes.len());
            buf[..end - start].copy_from_slice(&image.bytes[start..end]);
        }
        Ok(())
    }

    fn write_page(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut image = self.image.lock();
        image.page_writes += 1;
        match image.writes_left {
            Some(0) => return Ok(()),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        let start = pos as usize;
        let end = start + buf.len();
        if image.bytes.len() < end {
            image.bytes.resize(end, 0);
        }
        image.bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.image.lock().syncs += 1;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.image.lock().bytes.len() as u64
    }

    fn truncate(&mut self) -> Result<()> {
        self.image.lock().bytes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_end_return_zeroes() {
        let mut file = MemoryFile::from_bytes(vec![7u8; 10]);
        let mut buf = vec![0xFFu8; PAGE_SIZE];

        file.read_page(0, &mut buf).unwrap();

        assert_eq!(&buf[..10], &[7u8; 10]);
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn clones_share_the_same_image() {
        let file = MemoryFile::new();
        let mut writer = file.clone();

        writer.write_page(PAGE_SIZE as u64, &[1u8; PAGE_SIZE]).unwrap();

        assert_eq!(file.len(), 2 * PAGE_SIZE as u64);
        assert_eq!(file.snapshot()[PAGE_SIZE], 1);
    }

    #[test]
    fn write_limit_drops_later_writes() {
        let mut file = MemoryFile::new();
        file.limit_writes(Some(1));

        file.write_page(0, &[1u8; PAGE_SIZE]).unwrap();
        file.write_page(0, &[2u8; PAGE_SIZE]).unwrap();

        assert_eq!(file.page_writes(), 2);
        assert_eq!(file.snapshot()[0], 1);
    }
}
