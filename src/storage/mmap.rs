//! # Memory-Mapped Backing File
//!
//! `MmapFile` is the on-disk `StorageFile`. Page reads and writes are plain
//! slice copies into the mapping; the OS page cache does the I/O.
//!
//! ## Safety Considerations
//!
//! A mapping becomes invalid when the file is grown and remapped. All access
//! goes through `&mut self` methods that copy in or out of the mapping, so no
//! slice into the mapping ever outlives a call, and `grow()` can replace the
//! mapping freely.
//!
//! ## Growth
//!
//! Writes past the mapped length grow the file to the next multiple of
//! `GROWTH_STEP`, so that a stream of appends does not remap on every page:
//!
//! ```text
//! len 0 ──write page 3──> len 1 MiB (mapped)
//!       ──write page 300─> len 2 MiB (remapped)
//! ```
//!
//! The physical length can therefore exceed the logical size tracked in the
//! root page. The trailing bytes are zero and never referenced.
//!
//! ## Read-Only Mode
//!
//! A file opened read-only is mapped with `Mmap`; every write is rejected.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};

use super::file::StorageFile;
use crate::config::PAGE_SIZE;
use crate::error::StorageError;

const GROWTH_STEP: u64 = 1024 * 1024;

#[derive(Debug)]
enum Mapping {
    Unmapped,
    ReadOnly(Mmap),
    Writable(MmapMut),
}

#[derive(Debug)]
pub struct MmapFile {
    path: PathBuf,
    file: File,
    mapping: Mapping,
    len: u64,
    read_only: bool,
}

impl MmapFile {
    /// Opens `path`, creating it when missing unless `read_only`.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        let mut storage = Self {
            path: path.to_path_buf(),
            file,
            mapping: Mapping::Unmapped,
            len,
            read_only,
        };
        storage.remap()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remap(&mut self) -> Result<()> {
        if self.len == 0 {
            self.mapping = Mapping::Unmapped;
            return Ok(());
        }

        self.mapping = if self.read_only {
            // SAFETY: Mmap::map is unsafe because the file may be modified by
            // another process while mapped. The database file is owned by this
            // process for the lifetime of the mapping (optionally guarded by a
            // lock file), and every access copies out of the mapping within a
            // single call, so no reference outlives a remap.
            let map = unsafe {
                Mmap::map(&self.file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", self.path.display()))?
            };
            Mapping::ReadOnly(map)
        } else {
            // SAFETY: same reasoning as the read-only branch; additionally the
            // file was opened read+write and extended to `len` before mapping.
            let map = unsafe {
                MmapMut::map_mut(&self.file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", self.path.display()))?
            };
            Mapping::Writable(map)
        };
        Ok(())
    }

    fn grow(&mut self, min_len: u64) -> Result<()> {
        if min_len <= self.len {
            return Ok(());
        }

        if let Mapping::Writable(map) = &self.mapping {
            map.flush().wrap_err("failed to flush mmap before grow")?;
        }

        let new_len = min_len.div_ceil(GROWTH_STEP) * GROWTH_STEP;
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_len))?;
        self.len = new_len;

        self.remap().wrap_err("failed to remap file after grow")
    }
}

impl StorageFile for MmapFile {
    fn read_page(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let bytes: &[u8] = match &self.mapping {
            Mapping::Unmapped => &[],
            Mapping::ReadOnly(map) => &map[..],
            Mapping::Writable(map) => &map[..],
        };

        buf.fill(0);
        let start = pos as usize;
        if start < bytes.len() {
            let end = (start + buf.len()).min(bytes.len());
            buf[..end - start].copy_from_slice(&bytes[start..end]);
        }
        Ok(())
    }

    fn write_page(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            bail!(StorageError::InvalidOperation("database file is read-only"));
        }
        ensure!(
            pos % PAGE_SIZE as u64 == 0,
            "unaligned page write at offset {}",
            pos
        );

        self.grow(pos + buf.len() as u64)?;

        let Mapping::Writable(map) = &mut self.mapping else {
            bail!("file '{}' is not mapped for writing", self.path.display());
        };
        let start = pos as usize;
        map[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        match &self.mapping {
            Mapping::Writable(map) => map.flush().wrap_err("failed to sync mmap to disk"),
            _ => Ok(()),
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn reload(&mut self) -> Result<()> {
        let len = self
            .file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", self.path.display()))?
            .len();
        if len != self.len {
            self.len = len;
            self.remap().wrap_err("failed to remap file after reload")?;
        }
        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        if self.read_only {
            bail!(StorageError::InvalidOperation("database file is read-only"));
        }
        self.mapping = Mapping::Unmapped;
        self.file
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.path.display()))?;
        self.len = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");

        let storage = MmapFile::open(&path, false).unwrap();

        assert!(path.exists());
        assert_eq!(storage.len(), 0);
    }

    #[test]
    fn open_read_only_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.dbs");

        assert!(MmapFile::open(&path, true).is_err());
    }

    #[test]
    fn write_grows_in_steps_and_reads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");
        let mut storage = MmapFile::open(&path, false).unwrap();

        let page = [0xABu8; PAGE_SIZE];
        storage.write_page(3 * PAGE_SIZE as u64, &page).unwrap();

        assert_eq!(storage.len(), GROWTH_STEP);

        let mut buf = [0u8; PAGE_SIZE];
        storage.read_page(3 * PAGE_SIZE as u64, &mut buf).unwrap();
        assert_eq!(buf, page);

        storage.read_page(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn read_past_end_returns_zeroes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");
        let mut storage = MmapFile::open(&path, false).unwrap();

        let mut buf = [0xFFu8; PAGE_SIZE];
        storage.read_page(100 * GROWTH_STEP, &mut buf).unwrap();

        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sync_persists_changes_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");

        {
            let mut storage = MmapFile::open(&path, false).unwrap();
            let mut page = [0u8; PAGE_SIZE];
            page[50] = 0xBE;
            page[51] = 0xEF;
            storage.write_page(PAGE_SIZE as u64, &page).unwrap();
            storage.sync().unwrap();
        }

        let mut storage = MmapFile::open(&path, true).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        storage.read_page(PAGE_SIZE as u64, &mut buf).unwrap();

        assert_eq!(buf[50], 0xBE);
        assert_eq!(buf[51], 0xEF);
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");
        MmapFile::open(&path, false).unwrap();

        let mut storage = MmapFile::open(&path, true).unwrap();
        let err = storage.write_page(0, &[0u8; PAGE_SIZE]).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::InvalidOperation(_))
        ));
    }
}
