use std::io;
use std::mem;
use std::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system page size.
pub fn page_size() -> usize {
    // SAFETY: `GetSystemInfo` fills the zeroed struct it is given.
    let size = unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    };
    if size == 0 {
        4096
    } else {
        size
    }
}

/// Reserves and commits `len` bytes of read/write memory.
///
/// # Safety
///
/// `len` must be a non-zero multiple of [`page_size`].
pub unsafe fn map_pages(len: usize) -> io::Result<NonNull<u8>> {
    // SAFETY: no address hint; the caller guarantees a valid length.
    let raw = unsafe {
        VirtualAlloc(
            ptr::null(),
            len,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    NonNull::new(raw.cast::<u8>()).ok_or_else(io::Error::last_os_error)
}

/// Releases a region created by [`map_pages`].
///
/// # Safety
///
/// `ptr` must come from one successful `map_pages` call and must not have
/// been released already.
pub unsafe fn unmap_pages(ptr: NonNull<u8>, _len: usize) {
    // SAFETY: MEM_RELEASE requires a zero size and the base address.
    unsafe {
        VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE);
    }
}
