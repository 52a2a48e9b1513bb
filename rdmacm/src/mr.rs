//! Memory region registration handles.

use std::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Memory access flags for region registration. Local read access is
    /// always enabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: i32 {
        /// Enable local write access.
        const LOCAL_WRITE = rdmacm_sys::IBV_ACCESS_LOCAL_WRITE;
        /// Enable remote write access. Requires `LOCAL_WRITE`.
        const REMOTE_WRITE = rdmacm_sys::IBV_ACCESS_REMOTE_WRITE;
        /// Enable remote read access.
        const REMOTE_READ = rdmacm_sys::IBV_ACCESS_REMOTE_READ;
        /// Enable remote atomic operation access. Requires `LOCAL_WRITE`.
        const REMOTE_ATOMIC = rdmacm_sys::IBV_ACCESS_REMOTE_ATOMIC;
    }
}

/// A registered memory region. Deregistered when dropped; the underlying
/// buffer must outlive the registration.
pub struct MemoryRegion {
    mr: NonNull<rdmacm_sys::ibv_mr>,
}

impl MemoryRegion {
    /// # Safety
    /// `mr` must be a live registration returned by rdma-core.
    pub(crate) unsafe fn from_raw(mr: NonNull<rdmacm_sys::ibv_mr>) -> Self {
        Self { mr }
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> u32 {
        unsafe { (*self.mr.as_ptr()).rkey }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        unsafe { (*self.mr.as_ptr()).addr as u64 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { (*self.mr.as_ptr()).length }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            let rc = rdmacm_sys::rdma_dereg_mr(self.mr.as_ptr());
            if rc != 0 {
                log::error!("rdma_dereg_mr failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}
