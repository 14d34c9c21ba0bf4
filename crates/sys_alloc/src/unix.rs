use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: `sysconf` has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page_size = usize::try_from(raw).ok().filter(|&n| n > 0).unwrap_or(4096);
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// Maps `len` bytes of private anonymous memory.
///
/// # Safety
///
/// `len` must be a non-zero multiple of [`page_size`].
pub unsafe fn map_pages(len: usize) -> io::Result<NonNull<u8>> {
    let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    // SAFETY: anonymous mapping with no address hint; the caller guarantees
    // a valid length.
    let raw = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
    if raw == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(raw.cast::<u8>()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

/// Releases a mapping created by [`map_pages`].
///
/// # Safety
///
/// `ptr`/`len` must come from one successful `map_pages` call and must not
/// have been released already.
pub unsafe fn unmap_pages(ptr: NonNull<u8>, len: usize) {
    // SAFETY: guaranteed by the caller.
    unsafe {
        libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len);
    }
}
