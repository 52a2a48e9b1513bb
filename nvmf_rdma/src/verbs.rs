//! Production adapter from the queue-pair seam onto librdmacm.

use std::io;
use std::rc::Rc;

use rdmacm::{CmId, MemoryRegion, QpCaps};

use crate::qp::{RdmaQp, RegionHandle, Registration, Sge, WorkCompletion};

/// Scatter entries per SEND/READ/WRITE work request.
pub const TX_SGE: u32 = 1;
/// Scatter entries per RECV work request (capsule + in-capsule data).
pub const RX_SGE: u32 = 2;

impl RegionHandle for MemoryRegion {
    fn lkey(&self) -> u32 {
        self.lkey()
    }

    fn rkey(&self) -> u32 {
        self.rkey()
    }
}

/// Create the Reliable Connection QP for an accepted id and switch its
/// completion channels to non-blocking. The send queue is sized for a SEND
/// plus a concurrent READ/WRITE per slot.
pub fn setup_qp(id: &mut CmId, max_queue_depth: u16) -> io::Result<()> {
    id.create_qp(QpCaps {
        max_send_wr: max_queue_depth as u32 * 2,
        max_recv_wr: max_queue_depth as u32,
        max_send_sge: TX_SGE,
        max_recv_sge: RX_SGE,
    })?;
    id.set_cq_channels_nonblocking()?;
    log::trace!(
        "new RDMA QP {:#x}: send queue depth {}, recv queue depth {}",
        id.qp_num(),
        max_queue_depth as u32 * 2,
        max_queue_depth
    );
    Ok(())
}

/// A connection's verbs endpoint: the accepted CM id with its QP and CQs.
/// The id is shared with the acceptor just long enough to send the accept.
pub struct VerbsQueuePair {
    id: Rc<CmId>,
}

impl VerbsQueuePair {
    pub fn new(id: Rc<CmId>) -> Self {
        Self { id }
    }
}

impl RdmaQp for VerbsQueuePair {
    unsafe fn register(&self, addr: *mut u8, len: usize) -> io::Result<Registration> {
        let mr = self.id.reg_msgs(addr, len)?;
        Ok(Box::new(mr))
    }

    fn post_recv(&mut self, wr_id: u64, sg_list: &[Sge]) -> io::Result<()> {
        self.id.post_recv(wr_id, sg_list)
    }

    fn post_send(&mut self, wr_id: u64, sge: Sge) -> io::Result<()> {
        self.id.post_send(wr_id, sge)
    }

    fn post_rdma_read(
        &mut self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.id.post_rdma_read(wr_id, sge, remote_addr, rkey)
    }

    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.id.post_rdma_write(wr_id, sge, remote_addr, rkey)
    }

    fn poll_send_cq(&mut self) -> io::Result<Option<WorkCompletion>> {
        self.id.poll_send_cq()
    }

    fn poll_recv_cq(&mut self) -> io::Result<Option<WorkCompletion>> {
        self.id.poll_recv_cq()
    }
}
