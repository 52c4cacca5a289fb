use crate::error::Result;
use crate::page::PageId;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Access mode for a page-aligned byte window handed out by
/// [`PageFile::slice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceMode {
    Read,
    ReadWrite,
    Write,
}

/// A fixed-size paged file: the lowest layer of the storage core.
///
/// Every read/write goes through here. The file is guarded by a single
/// mutex — the paged engine is this crate's only writer (spec §4.H), and
/// the mutex only serializes the underlying syscalls, not logical
/// transactions.
pub struct PageFile {
    file: Arc<Mutex<File>>,
    page_size: u32,
}

impl PageFile {
    pub fn open(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(PageFile {
            file: Arc::new(Mutex::new(file)),
            page_size,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of pages needed to hold `byte_len` bytes, rounded up.
    pub fn pages(&self, byte_len: u64) -> u32 {
        let page_size = self.page_size as u64;
        (byte_len.div_ceil(page_size)) as u32
    }

    pub fn read(&self, page: PageId, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), self.page_size as usize);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.offset_of(page)))?;
        // a page that has never been written reads as zeroes
        match file.read_exact(buffer) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                buffer.fill(0);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, page: PageId, buffer: &[u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), self.page_size as usize);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.offset_of(page)))?;
        file.write_all(buffer)?;
        Ok(())
    }

    /// Acquires a page-aligned byte window over `count` pages starting at
    /// `page`. `READ` and `READ_WRITE` slices are pre-populated from disk;
    /// `WRITE` slices start zeroed since the caller intends to overwrite the
    /// whole extent. The window must be released with [`PageFile::unslice`]
    /// on every exit path.
    pub fn slice(&self, mode: SliceMode, page: PageId, count: u32) -> Result<PageSlice> {
        let len = count as usize * self.page_size as usize;
        let mut data = vec![0u8; len];

        if mode != SliceMode::Write {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(self.offset_of(page)))?;
            match file.read_exact(&mut data) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(PageSlice {
            file: self.file.clone(),
            mode,
            page,
            count,
            page_size: self.page_size,
            data,
            released: false,
        })
    }

    /// Releases a byte window, flushing it back to disk if it was opened
    /// for writing.
    pub fn unslice(&self, mut slice: PageSlice) -> Result<()> {
        slice.flush_if_writable()
    }

    fn offset_of(&self, page: PageId) -> u64 {
        page.0 as u64 * self.page_size as u64
    }
}

/// A page-aligned byte window returned by [`PageFile::slice`].
pub struct PageSlice {
    file: Arc<Mutex<File>>,
    mode: SliceMode,
    page: PageId,
    count: u32,
    page_size: u32,
    data: Vec<u8>,
    released: bool,
}

impl PageSlice {
    pub fn page(&self) -> PageId {
        self.page
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn flush_if_writable(&mut self) -> Result<()> {
        self.released = true;
        if self.mode == SliceMode::Read {
            return Ok(());
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.page.0 as u64 * self.page_size as u64))?;
        file.write_all(&self.data)?;
        Ok(())
    }
}

impl Drop for PageSlice {
    fn drop(&mut self) {
        if !self.released && self.mode != SliceMode::Read {
            // Caller forgot to unslice a writable window; best-effort flush
            // so a dropped slice never silently loses writes.
            if let Err(err) = self.flush_if_writable() {
                tracing::warn!(error = %err, page = %self.page, "failed to flush page slice on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_tmp(page_size: u32) -> PageFile {
        let tmp = NamedTempFile::new().unwrap();
        PageFile::open(tmp.path(), page_size).unwrap()
    }

    #[test]
    fn write_then_read_round_trips() {
        let file = open_tmp(16);
        file.write(PageId(0), &[7u8; 16]).unwrap();
        let mut buf = [0u8; 16];
        file.read(PageId(0), &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn unwritten_page_reads_as_zero() {
        let file = open_tmp(16);
        let mut buf = [0xFFu8; 16];
        file.read(PageId(5), &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn pages_rounds_up() {
        let file = open_tmp(100);
        assert_eq!(file.pages(0), 0);
        assert_eq!(file.pages(1), 1);
        assert_eq!(file.pages(100), 1);
        assert_eq!(file.pages(101), 2);
    }

    #[test]
    fn slice_read_write_round_trips() {
        let file = open_tmp(8);
        file.write(PageId(2), &[1u8; 8]).unwrap();

        let mut slice = file.slice(SliceMode::ReadWrite, PageId(2), 1).unwrap();
        assert_eq!(slice.bytes(), &[1u8; 8]);
        slice.bytes_mut().copy_from_slice(&[2u8; 8]);
        file.unslice(slice).unwrap();

        let mut buf = [0u8; 8];
        file.read(PageId(2), &mut buf).unwrap();
        assert_eq!(buf, [2u8; 8]);
    }

    #[test]
    fn slice_write_mode_starts_zeroed_even_over_existing_data() {
        let file = open_tmp(4);
        file.write(PageId(0), &[9u8; 4]).unwrap();
        let slice = file.slice(SliceMode::Write, PageId(0), 1).unwrap();
        assert_eq!(slice.bytes(), &[0u8; 4]);
        file.unslice(slice).unwrap();
    }
}
