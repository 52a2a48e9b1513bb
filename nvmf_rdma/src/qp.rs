//! The seam between the request pipeline and the RDMA provider.
//!
//! The state machine drives a queue pair exclusively through [`RdmaQp`]:
//! one method per verbs operation, with the slot index carried as the
//! `wr_id` cookie. Production connections use the adapter in
//! [`crate::verbs`]; the hardware-free tests use
//! [`crate::test_utils::MockQp`].

use std::io;

pub use rdmacm::types::{Sge, WcOpcode, WorkCompletion};

/// A registered memory region's keys. Deregistration happens when the
/// handle is dropped.
pub trait RegionHandle {
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
}

/// Owned registration handle.
pub type Registration = Box<dyn RegionHandle>;

/// Operations the request pipeline issues against a connection's queue
/// pair and completion queues.
pub trait RdmaQp {
    /// Register `len` bytes at `addr` with the queue pair's protection
    /// domain.
    ///
    /// # Safety
    /// The buffer must stay alive and at a fixed address until the returned
    /// registration is dropped.
    unsafe fn register(&self, addr: *mut u8, len: usize) -> io::Result<Registration>;

    /// Post a receive scattering into `sg_list` (at most two entries).
    fn post_recv(&mut self, wr_id: u64, sg_list: &[Sge]) -> io::Result<()>;

    /// Post a signaled SEND of one scatter entry.
    fn post_send(&mut self, wr_id: u64, sge: Sge) -> io::Result<()>;

    /// Post a signaled RDMA READ from host memory into `sge`.
    fn post_rdma_read(&mut self, wr_id: u64, sge: Sge, remote_addr: u64, rkey: u32)
        -> io::Result<()>;

    /// Post a signaled RDMA WRITE of `sge` into host memory.
    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()>;

    /// Harvest one completion from the send CQ; `None` when drained.
    fn poll_send_cq(&mut self) -> io::Result<Option<WorkCompletion>>;

    /// Harvest one completion from the recv CQ; `None` when drained.
    fn poll_recv_cq(&mut self) -> io::Result<Option<WorkCompletion>>;
}
