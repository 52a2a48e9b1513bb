//! Pinned buffer allocation for HCA-visible memory.

use std::io;
use std::ptr::NonNull;

/// Alignment used for the per-connection capsule arrays.
pub const CAPSULE_ARRAY_ALIGN: usize = 0x1000;

/// Alignment used for the session large-buffer pool.
pub const POOL_ALIGN: usize = 0x20000;

/// A page-aligned, zero-initialized allocation that stays at a fixed
/// address for its whole lifetime, suitable for memory registration.
pub struct Pinned {
    ptr: NonNull<u8>,
    len: usize,
}

impl Pinned {
    pub fn alloc(len: usize, align: usize) -> io::Result<Self> {
        debug_assert!(len > 0);
        debug_assert!(align.is_power_of_two());

        let ptr = unsafe {
            let mut ptr: *mut libc::c_void = std::ptr::null_mut();
            let rc = libc::posix_memalign(&mut ptr, align, len);
            if rc != 0 {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    format!("posix_memalign failed: {}", rc),
                ));
            }
            std::ptr::write_bytes(ptr as *mut u8, 0, len);
            NonNull::new_unchecked(ptr as *mut u8)
        };

        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Base address for scatter/gather entries.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Pinned {
    fn drop(&mut self) {
        unsafe {
            libc::free(self.ptr.as_ptr() as *mut libc::c_void);
        }
    }
}

// Safety: Pinned owns its allocation exclusively.
unsafe impl Send for Pinned {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_aligned_and_zeroed() {
        let buf = Pinned::alloc(8192, CAPSULE_ARRAY_ALIGN).unwrap();
        assert_eq!(buf.addr() as usize % CAPSULE_ARRAY_ALIGN, 0);
        assert_eq!(buf.len(), 8192);
        let slice = unsafe { std::slice::from_raw_parts(buf.as_ptr(), buf.len()) };
        assert!(slice.iter().all(|&b| b == 0));
    }
}
