//! # SIEVE Page Pool
//!
//! `PagePool` caches fixed-size pages of the backing file and is the only way
//! the engine touches file bytes. It uses the SIEVE eviction algorithm:
//!
//! - On access: set the frame's visited flag
//! - On eviction: sweep frames with a "hand" pointer
//!   - visited: clear the flag, move on (second chance)
//!   - not visited: evict this frame
//!
//! A scan over many bitmap or index pages therefore does not flush the pages
//! that are hit again and again (the header, hot bitmap pages).
//!
//! ## Pin Protocol
//!
//! ```text
//! page(pos)      -> &[u8]       pin for read
//! page_mut(pos)  -> &mut [u8]   pin for write, marks the frame dirty
//! end of borrow                 unpin
//! ```
//!
//! Both calls borrow the pool mutably, so the borrow checker guarantees that no
//! page slice is alive when another page is loaded and a frame may be evicted.
//! No pin counts are needed.
//!
//! ## Write-Back
//!
//! Dirty frames are written back when they are evicted (without sync) and by
//! `flush()`, which writes every dirty frame in file order and then syncs. The
//! commit protocol relies on `flush()` as its durability barrier.
//!
//! ## Memory Layout
//!
//! ```text
//! Frame {
//!     pos: u64,                 // page-aligned file offset
//!     visited: bool,
//!     dirty: bool,
//!     data: Box<[u8; 4096]>,
//! }
//! ```

use eyre::{ensure, Result};
use hashbrown::HashMap;

use super::file::StorageFile;
use crate::config::{MIN_PAGE_POOL_SIZE, PAGE_SIZE};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

struct Frame {
    pos: u64,
    visited: bool,
    dirty: bool,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Frame {
    fn new(pos: u64) -> Self {
        Self {
            pos,
            visited: false,
            dirty: false,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }
}

pub struct PagePool {
    file: Box<dyn StorageFile>,
    frames: Vec<Frame>,
    index: HashMap<u64, usize>,
    hand: usize,
    capacity: usize,
}

impl PagePool {
    pub fn new(file: Box<dyn StorageFile>, capacity: usize) -> Result<Self> {
        ensure!(
            capacity >= MIN_PAGE_POOL_SIZE,
            "page pool capacity {} must be at least {}",
            capacity,
            MIN_PAGE_POOL_SIZE
        );

        Ok(Self {
            file,
            frames: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        })
    }

    /// Physical length of the backing file.
    pub fn file_len(&self) -> u64 {
        self.file.len()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.frames.iter().filter(|f| f.dirty).count()
    }

    pub fn page(&mut self, pos: u64) -> Result<&[u8]> {
        let idx = self.frame(pos)?;
        Ok(&self.frames[idx].data[..])
    }

    pub fn page_mut(&mut self, pos: u64) -> Result<&mut [u8]> {
        let idx = self.frame(pos)?;
        let frame = &mut self.frames[idx];
        frame.dirty = true;
        Ok(&mut frame.data[..])
    }

    /// Reads `buf.len()` bytes starting at `pos`, crossing pages as needed.
    pub fn read(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let at = pos + done as u64;
            let offs = (at & PAGE_MASK) as usize;
            let n = (PAGE_SIZE - offs).min(buf.len() - done);
            let page = self.page(at & !PAGE_MASK)?;
            buf[done..done + n].copy_from_slice(&page[offs..offs + n]);
            done += n;
        }
        Ok(())
    }

    /// Writes `bytes` starting at `pos`, crossing pages as needed.
    pub fn write(&mut self, pos: u64, bytes: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < bytes.len() {
            let at = pos + done as u64;
            let offs = (at & PAGE_MASK) as usize;
            let n = (PAGE_SIZE - offs).min(bytes.len() - done);
            let page = self.page_mut(at & !PAGE_MASK)?;
            page[offs..offs + n].copy_from_slice(&bytes[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst`. The ranges must not overlap.
    pub fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<()> {
        ensure!(
            dst + len <= src || src + len <= dst,
            "overlapping page copy: dst={} src={} len={}",
            dst,
            src,
            len
        );

        let mut chunk = [0u8; PAGE_SIZE];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(PAGE_SIZE as u64) as usize;
            self.read(src + done, &mut chunk[..n])?;
            self.write(dst + done, &chunk[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Zero-fills `len` bytes at `pos`.
    pub fn zero(&mut self, pos: u64, len: u64) -> Result<()> {
        let zeros = [0u8; PAGE_SIZE];
        let mut done = 0u64;
        while done < len {
            let n = (len - done).min(PAGE_SIZE as u64) as usize;
            self.write(pos + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Writes every dirty frame in file order and syncs the file.
    pub fn flush(&mut self) -> Result<()> {
        let mut dirty: Vec<usize> = (0..self.frames.len())
            .filter(|&i| self.frames[i].dirty)
            .collect();
        dirty.sort_unstable_by_key(|&i| self.frames[i].pos);

        for idx in dirty {
            let frame = &mut self.frames[idx];
            self.file.write_page(frame.pos, &frame.data[..])?;
            frame.dirty = false;
        }

        self.file.sync()
    }

    /// Forgets every frame, dirty or not.
    pub fn discard(&mut self) {
        self.frames.clear();
        self.index.clear();
        self.hand = 0;
    }

    /// Forgets every frame and lets the file notice external growth.
    pub fn reload(&mut self) -> Result<()> {
        ensure!(
            self.dirty_count() == 0,
            "cannot reload the page pool with dirty frames"
        );
        self.discard();
        self.file.reload()
    }

    pub fn truncate_file(&mut self) -> Result<()> {
        self.discard();
        self.file.truncate()
    }

    fn frame(&mut self, pos: u64) -> Result<usize> {
        ensure!(pos & PAGE_MASK == 0, "unaligned page access at offset {}", pos);

        if let Some(&idx) = self.index.get(&pos) {
            self.frames[idx].visited = true;
            return Ok(idx);
        }

        let idx = if self.frames.len() < self.capacity {
            self.frames.push(Frame::new(pos));
            self.frames.len() - 1
        } else {
            let victim = self.evict();
            let frame = &mut self.frames[victim];
            if frame.dirty {
                self.file.write_page(frame.pos, &frame.data[..])?;
                frame.dirty = false;
            }
            self.index.remove(&frame.pos);
            frame.pos = pos;
            frame.visited = false;
            victim
        };

        let frame = &mut self.frames[idx];
        if let Err(e) = self.file.read_page(pos, &mut frame.data[..]) {
            self.frames.swap_remove(idx);
            self.rebuild_index();
            return Err(e);
        }
        self.index.insert(pos, idx);
        Ok(idx)
    }

    fn evict(&mut self) -> usize {
        let len = self.frames.len();
        loop {
            let idx = self.hand;
            self.hand = (self.hand + 1) % len;
            let frame = &mut self.frames[idx];
            if frame.visited {
                frame.visited = false;
                continue;
            }
            return idx;
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, frame) in self.frames.iter().enumerate() {
            self.index.insert(frame.pos, i);
        }
        if self.hand >= self.frames.len() {
            self.hand = 0;
        }
    }
}
