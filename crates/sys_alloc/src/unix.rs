use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes starting at an `align`-aligned address.
    ///
    /// When `align` exceeds the page size, `len + align` bytes are reserved
    /// and the unaligned head and the unused tail are unmapped again.
    ///
    /// # Safety
    ///
    /// Calls `mmap`/`munmap`; `align` must be a power of two no smaller
    /// than the page size.
    pub unsafe fn map_anon(
        len: usize,
        align: usize,
        populate: bool,
        no_reserve: bool,
    ) -> io::Result<Self> {
        let page = page_size();
        let len = (len + page - 1) & !(page - 1);
        let slack = if align > page { align } else { 0 };
        let reserve = len.checked_add(slack).ok_or_else(|| {
            Error::new(io::ErrorKind::InvalidInput, "mapping length overflows")
        })?;

        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANON
            | if populate { MAP_POPULATE } else { 0 }
            | if no_reserve { MAP_NORESERVE } else { 0 };
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let raw = unsafe { libc::mmap(ptr::null_mut(), reserve, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        if slack == 0 {
            return Ok(Self { ptr: raw, len });
        }

        let start = raw as usize;
        let aligned = (start + align - 1) & !(align - 1);
        let head = aligned - start;
        let tail = reserve - head - len;
        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(Self {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
