//! # Memory-Mapped Pager
//!
//! `Pager` presents the data file as an array of 4096-byte pages with
//! zero-copy read views, explicit page writes, file extension, range flush,
//! and full fsync. It is the only component that touches the data file.
//!
//! ## Design
//!
//! The file is mapped read-write in its entirety. `page()` returns a slice
//! pointing directly into the map; `write_page_at()` copies a page image into
//! the map. Growing the file (`allocate_more_pages` / `ensure_continuous`)
//! flushes the old map and remaps.
//!
//! ## View Invalidation
//!
//! Remapping invalidates earlier views. Growth requires `&mut self`, so the
//! borrow checker ensures no view outlives the map it came from — the
//! compile-time rendition of pinning a pager-state generation. Components
//! that must read concurrently with a potential grow (read transactions on
//! other threads) take `page_copy()` under a short read lock instead of
//! holding a view.
//!
//! ## Scratch Page
//!
//! `temp_page()` hands out a page-sized scratch buffer owned by the pager.
//! The journal applier builds the next file-header image in it before the
//! image is copied into page 0 or 1.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use super::PAGE_SIZE;

pub struct Pager {
    file: File,
    mmap: MmapMut,
    page_count: u64,
    temp: Box<[u8]>,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("page_count", &self.page_count)
            .finish()
    }
}

impl Pager {
    pub fn create<P: AsRef<Path>>(path: P, initial_page_count: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(
            initial_page_count > 0,
            "initial page count must be at least 1"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file '{}'", path.display()))?;

        let file_size = initial_page_count * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", file_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. We just created this file with truncate=true
        // 2. The file size is a multiple of PAGE_SIZE
        // 3. The mmap lifetime is tied to Pager, preventing use-after-unmap
        // 4. All access goes through page()/page_mut() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: initial_page_count,
            temp: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty data file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "data file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        // SAFETY: see create(). The file is opened read+write and is not
        // shared with external writers; all access is bounds-checked.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            page_count: file_size / PAGE_SIZE as u64,
            temp: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        })
    }

    pub fn page(&self, page_no: u64) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * PAGE_SIZE;
        Ok(&self.mmap[offset..offset + PAGE_SIZE])
    }

    pub fn page_mut(&mut self, page_no: u64) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let offset = page_no as usize * PAGE_SIZE;
        Ok(&mut self.mmap[offset..offset + PAGE_SIZE])
    }

    /// Copies a page out of the map. Safe to call from readers that must not
    /// hold a view across a concurrent grow.
    pub fn page_copy(&self, page_no: u64) -> Result<Vec<u8>> {
        Ok(self.page(page_no)?.to_vec())
    }

    /// Copies a page image into the data file at `page_no`.
    pub fn write_page_at(&mut self, page_no: u64, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() <= PAGE_SIZE,
            "page image of {} bytes exceeds page size {}",
            data.len(),
            PAGE_SIZE
        );
        let page = self.page_mut(page_no)?;
        page[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn allocate_more_pages(&mut self, new_page_count: u64) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_page_count * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend data file to {} bytes", new_size))?;

        // SAFETY: grow requires &mut self, so no page views can exist
        // (borrow checker). The old map was flushed above, the file was
        // extended before remapping, and the old map is dropped on assign.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.page_count = new_page_count;

        Ok(())
    }

    /// Extends the file if necessary so pages `[first, first + count)` are
    /// backed.
    pub fn ensure_continuous(&mut self, first_page: u64, count: u64) -> Result<()> {
        self.allocate_more_pages(first_page + count)
    }

    /// Writes the dirty mapping for a page range back to the OS.
    pub fn flush_range(&self, first_page: u64, count: u64) -> Result<()> {
        ensure!(
            first_page + count <= self.page_count,
            "flush range [{}, {}) out of bounds (page_count={})",
            first_page,
            first_page + count,
            self.page_count
        );
        self.mmap
            .flush_range(first_page as usize * PAGE_SIZE, count as usize * PAGE_SIZE)
            .wrap_err("failed to flush page range")
    }

    /// Full fsync of the data file.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync data file")?;
        self.file
            .sync_all()
            .wrap_err("failed to sync data file metadata")
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn file_size(&self) -> u64 {
        self.page_count * PAGE_SIZE as u64
    }

    /// A page-sized scratch buffer, zeroed on each call.
    pub fn temp_page(&mut self) -> &mut [u8] {
        self.temp.fill(0);
        &mut self.temp
    }
}
