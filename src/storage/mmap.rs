//! # Memory-Mapped File Region
//!
//! This module implements `MmapRegion`, the lowest layer of the store: a
//! growable read/write shared mapping of a single regular file.
//!
//! ## Design Philosophy
//!
//! All page I/O goes through the mapping. Instead of copying page data between
//! kernel buffers and a user-space page cache, the file is mapped directly into
//! the process address space and the OS page cache serves reads and absorbs
//! writes. Durability is explicit: nothing is guaranteed on disk until
//! [`MmapRegion::sync`] returns.
//!
//! ## Safety Considerations
//!
//! A mapped region becomes invalid when the file is grown and remapped. The
//! typical runtime solutions (hazard pointers, epochs, reference counting) all
//! cost something per access. This crate instead leverages the borrow checker:
//!
//! ```text
//! slice(&self)         -> &[u8]      // immutable borrow of self
//! slice_mut(&mut self) -> &mut [u8]  // mutable borrow of self
//! grow(&mut self)                    // mutable borrow (exclusive)
//! ```
//!
//! Since `grow()` requires `&mut self`, the compiler ensures no window into the
//! mapping exists when the region is remapped. Callers that allocate pages mid
//! operation must therefore re-fetch their windows, and the compiler enforces
//! it.
//!
//! ## Growth
//!
//! `grow()` flushes the old mapping asynchronously, truncates the file to the
//! new length, and remaps. The base address may move; every previously handed
//! out window is invalid afterwards. The pager layer owns the doubling policy;
//! this layer only performs the exact resize.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

use super::PAGE_SIZE;

#[derive(Debug)]
pub struct MmapRegion {
    file: File,
    mmap: MmapMut,
    len: usize,
    path: PathBuf,
}

impl MmapRegion {
    /// Opens (or creates) `path` and maps it read/write/shared.
    ///
    /// A file shorter than `min_len` is extended to exactly `min_len` before
    /// mapping, so a fresh store starts with a usable region instead of
    /// growing page by page.
    pub fn open<P: AsRef<Path>>(path: P, min_len: u64) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;

        let mut len = metadata.len();
        if len < min_len {
            file.set_len(min_len).wrap_err_with(|| {
                format!("failed to extend '{}' to {} bytes", path.display(), min_len)
            })?;
            len = min_len;
        }

        ensure!(
            len % PAGE_SIZE as u64 == 0,
            "store file '{}' size {} is not a multiple of page size {}",
            path.display(),
            len,
            PAGE_SIZE
        );

        // SAFETY: MmapMut::map_mut is unsafe because a memory-mapped file can
        // be modified externally, which would be undefined behavior. This is
        // safe because:
        // 1. Store files are owned by a single Engine and are not meant to be
        //    modified by external processes while open
        // 2. The mmap lifetime is tied to MmapRegion, preventing use-after-unmap
        // 3. All access goes through slice()/slice_mut() which bounds-check
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        debug!(path = %path.display(), len, "mapped store file");

        Ok(Self {
            file,
            mmap,
            len: len as usize,
            path: path.to_path_buf(),
        })
    }

    /// Current mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns an immutable window into the mapping.
    ///
    /// The window is valid only until the next call that can remap the region
    /// (`grow`); the borrow checker enforces this.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("slice range overflows: offset={}, len={}", offset, len))?;
        ensure!(
            end <= self.len,
            "slice [{}, {}) out of bounds (mapped len={})",
            offset,
            end,
            self.len
        );
        Ok(&self.mmap[offset..end])
    }

    /// Returns a mutable window into the mapping.
    pub fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("slice range overflows: offset={}, len={}", offset, len))?;
        ensure!(
            end <= self.len,
            "slice [{}, {}) out of bounds (mapped len={})",
            offset,
            end,
            self.len
        );
        Ok(&mut self.mmap[offset..end])
    }

    /// Returns two disjoint mutable windows of the same length.
    ///
    /// Needed by node operations that rewrite a page pair in place (split,
    /// borrow, merge) without staging entries through a heap buffer.
    pub fn slice_pair_mut(
        &mut self,
        offset_a: usize,
        offset_b: usize,
        len: usize,
    ) -> Result<(&mut [u8], &mut [u8])> {
        ensure!(
            offset_a.abs_diff(offset_b) >= len,
            "slice pair overlaps: a={}, b={}, len={}",
            offset_a,
            offset_b,
            len
        );
        let end = offset_a.max(offset_b).checked_add(len).ok_or_else(|| {
            eyre::eyre!(
                "slice range overflows: offset={}, len={}",
                offset_a.max(offset_b),
                len
            )
        })?;
        ensure!(
            end <= self.len,
            "slice pair [{}, {}) out of bounds (mapped len={})",
            offset_a.min(offset_b),
            end,
            self.len
        );

        if offset_a < offset_b {
            let (lo, hi) = self.mmap.split_at_mut(offset_b);
            Ok((&mut lo[offset_a..offset_a + len], &mut hi[..len]))
        } else {
            let (lo, hi) = self.mmap.split_at_mut(offset_a);
            Ok((&mut hi[..len], &mut lo[offset_b..offset_b + len]))
        }
    }

    /// Extends the file to `new_len` and remaps it.
    ///
    /// Every window previously returned by `slice`/`slice_mut` is invalid
    /// after this returns. No-op if `new_len` does not exceed the current
    /// length.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len as usize <= self.len {
            return Ok(());
        }

        ensure!(
            new_len % PAGE_SIZE as u64 == 0,
            "grow target {} is not a multiple of page size {}",
            new_len,
            PAGE_SIZE
        );

        self.mmap
            .flush_async()
            .wrap_err("failed to flush mapping before grow")?;

        self.file.set_len(new_len).wrap_err_with(|| {
            format!(
                "failed to extend '{}' to {} bytes",
                self.path.display(),
                new_len
            )
        })?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mapping becomes
        // invalid. This is safe because:
        // 1. grow() takes &mut self, so no window borrows can exist here
        // 2. The old mapping was flushed above
        // 3. The file was extended to new_len before remapping
        // 4. The old mapping is dropped when the new one is assigned
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?
        };

        debug!(path = %self.path.display(), old_len = self.len, new_len, "grew store file");
        self.len = new_len as usize;

        Ok(())
    }

    /// Synchronously flushes the whole mapping to disk (`msync`).
    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to sync '{}' to disk", self.path.display()))
    }

    /// Advises the kernel that `[offset, offset + len)` will be read soon.
    #[allow(unused_variables)]
    pub fn prefetch(&self, offset: usize, len: usize) {
        if offset >= self.len {
            return;
        }
        let len = len.min(self.len - offset);

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a hint and has no memory
        // safety impact. The range is clamped to the mapping above, so the
        // pointer arithmetic stays inside the mapped region.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
    }
}
