//! Backing-file abstraction used by the page pool.
//!
//! The pool only ever transfers whole pages at page-aligned offsets, so the
//! trait is page granular. Reads past the end of the file return zeroes and
//! writes past the end grow the file; the engine tracks the logical file size
//! itself in the root page.

use eyre::Result;

pub trait StorageFile: Send {
    /// Fills `buf` (exactly one page) with the page at `pos`.
    fn read_page(&mut self, pos: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes one page at `pos`, growing the file when needed.
    fn write_page(&mut self, pos: u64, buf: &[u8]) -> Result<()>;

    /// Makes every completed write durable.
    fn sync(&mut self) -> Result<()>;

    /// Physical length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all content. Used when a database is opened with truncation.
    fn truncate(&mut self) -> Result<()>;

    /// Picks up growth made by another writer of the same file.
    fn reload(&mut self) -> Result<()> {
        Ok(())
    }
}
