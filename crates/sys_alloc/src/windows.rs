use std::io::{self, Error};
use std::mem;
use std::ptr;

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Attempts at re-reserving an aligned range before giving up.
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        match info.dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MmapInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MmapInner {
    /// Commits `len` bytes at an `align`-aligned address.
    ///
    /// Windows cannot release part of a reservation, so an oversized range
    /// is reserved to discover a suitable address, released, and the aligned
    /// sub-range is reserved again. Another thread may take the address in
    /// between, hence the retry loop.
    ///
    /// # Safety
    ///
    /// Calls `VirtualAlloc`/`VirtualFree`.
    pub unsafe fn map_anon(
        len: usize,
        align: usize,
        _populate: bool,
        _no_reserve: bool,
    ) -> io::Result<Self> {
        if align <= allocation_granularity() {
            let ptr = unsafe { VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            return Ok(Self { ptr, len });
        }

        let reserve = len
            .checked_add(align)
            .ok_or_else(|| Error::new(io::ErrorKind::InvalidInput, "mapping length overflows"))?;

        for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
            let probe = unsafe { VirtualAlloc(ptr::null(), reserve, MEM_RESERVE, PAGE_READWRITE) };
            if probe.is_null() {
                return Err(Error::last_os_error());
            }
            let aligned = (probe as usize + align - 1) & !(align - 1);
            unsafe {
                VirtualFree(probe, 0, MEM_RELEASE);
            }

            let ptr = unsafe {
                VirtualAlloc(
                    aligned as *const std::ffi::c_void,
                    len,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };
            if !ptr.is_null() {
                return Ok(Self { ptr, len });
            }
        }

        Err(Error::new(
            io::ErrorKind::OutOfMemory,
            "could not reserve an aligned range",
        ))
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                // MEM_RELEASE requires dwSize to be 0
                VirtualFree(self.ptr, 0, MEM_RELEASE);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
