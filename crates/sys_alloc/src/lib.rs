//! Page-granular anonymous memory runs.
//!
//! A [`PageRun`] is a contiguous, zero-filled, read/write region obtained
//! directly from the operating system. The region is returned to the OS when
//! the run is dropped.

use std::io;
use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Rounds `len` up to a whole number of pages.
///
/// Returns `None` if the rounded length overflows `usize`.
#[must_use]
pub fn round_to_pages(len: usize) -> Option<usize> {
    let page = page_size();
    len.checked_add(page - 1).map(|n| n & !(page - 1))
}

/// A contiguous run of pages mapped from the OS.
pub struct PageRun {
    ptr: NonNull<u8>,
    len: usize,
}

impl PageRun {
    /// Maps a fresh run of at least `len` bytes.
    ///
    /// The length is rounded up to the page size. The memory is zero-filled
    /// and aligned to at least the page size.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for a zero or overflowing length, and the OS
    /// error if the mapping fails.
    pub fn map(len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page run length must be greater than 0",
            ));
        }
        let len = round_to_pages(len).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "page run length overflows")
        })?;

        // SAFETY: `len` is a non-zero multiple of the page size.
        let ptr = unsafe { os::map_pages(len)? };
        Ok(Self { ptr, len })
    }

    /// Start of the run.
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Length of the run in bytes (a multiple of the page size).
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if `ptr` points into this run.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.len
    }
}

impl Drop for PageRun {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping created by `map_pages` that
        // has not been released yet.
        unsafe { os::unmap_pages(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for PageRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRun")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: a `PageRun` owns its mapping outright; the raw pointer is never
// shared with another owner.
unsafe impl Send for PageRun {}
// SAFETY: `&PageRun` only exposes the address and length.
unsafe impl Sync for PageRun {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_round_to_pages() {
        let ps = page_size();
        assert_eq!(round_to_pages(1), Some(ps));
        assert_eq!(round_to_pages(ps), Some(ps));
        assert_eq!(round_to_pages(ps + 1), Some(2 * ps));
        assert_eq!(round_to_pages(usize::MAX), None);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = PageRun::map(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_run_is_zeroed_and_writable() {
        let run = PageRun::map(100).expect("failed to map");
        assert_eq!(run.len(), page_size());
        assert_eq!(run.as_ptr() as usize % page_size(), 0);

        unsafe {
            assert_eq!(ptr::read_volatile(run.as_ptr().add(99)), 0);
            ptr::write_volatile(run.as_ptr().add(99), 42);
            assert_eq!(ptr::read_volatile(run.as_ptr().add(99)), 42);
        }
    }

    #[test]
    fn test_contains() {
        let run = PageRun::map(page_size() * 2).expect("failed to map");
        assert!(run.contains(run.as_ptr()));
        assert!(run.contains(unsafe { run.as_ptr().add(run.len() - 1) }));
        assert!(!run.contains(unsafe { run.as_ptr().add(run.len()) }));
    }
}
