//! Per-connection state and the request pipeline.
//!
//! Request completion runs in three steps:
//!
//! 1. Move any data to the host with an RDMA WRITE. Unnecessary when the
//!    command carries no data or writes toward the controller
//!    (`transfer_data`).
//! 2. On transfer completion, advance `sq_head`, re-post the recv capsule,
//!    and send the completion (`send_completion`).
//! 3. On acknowledgement of the completion SEND, drop the outstanding
//!    request count (`ack_completion`).
//!
//! Two entry points start the process: [`RdmaConn::req_complete`], which
//! walks all three steps, and [`RdmaConn::req_release`], which skips
//! straight to step 3.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, error, trace};

use crate::capsule::{
    DataTransfer, NvmeCmd, NvmeCpl, SglDescriptor, CMD_CAPSULE_SIZE, RSP_CAPSULE_SIZE,
    SC_DATA_SGL_LENGTH_INVALID, SC_INVALID_SGL_OFFSET, SC_SGL_DESCRIPTOR_TYPE_INVALID, SC_SUCCESS,
    SGL_SUBTYPE_ADDRESS, SGL_SUBTYPE_INVALIDATE_KEY, SGL_SUBTYPE_OFFSET,
};
use crate::error::{Error, Result};
use crate::mem::{Pinned, CAPSULE_ARRAY_ALIGN};
use crate::pool::RdmaSession;
use crate::qp::{RdmaQp, Registration, Sge, WcOpcode};
use crate::request::{ExecutingRequest, NvmfBackend, PrepResult, RdmaRequest, ReqBuf, ReqState};

/// An RDMA connection: the queue pair, the pinned capsule arrays, one
/// request slot per queue position, and the two flow-control credits.
pub struct RdmaConn {
    id: u64,
    max_queue_depth: u16,
    max_rw_depth: u16,
    /// Requests outstanding from RECV completion until SEND ack.
    cur_queue_depth: u16,
    /// RDMA READ/WRITE operations posted and not yet completed.
    cur_rdma_rw_depth: u16,
    sq_head: u16,
    sq_head_max: u16,
    in_capsule_data_size: u32,
    max_io_size: u32,
    reqs: Vec<RdmaRequest>,
    /// Slots waiting for a session pool chunk.
    pending_data_buf_queue: VecDeque<usize>,
    /// Slots waiting for an RDMA READ/WRITE credit.
    pending_rdma_rw_queue: VecDeque<usize>,
    session: Option<Rc<RefCell<RdmaSession>>>,
    // Declaration order is teardown order: deregister the arrays, then
    // tear down the QP, then free the memory.
    cmds_mr: Registration,
    cpls_mr: Registration,
    bufs_mr: Registration,
    qp: Box<dyn RdmaQp>,
    cmds: Pinned,
    cpls: Pinned,
    bufs: Pinned,
}

impl RdmaConn {
    /// Build a connection over an already-created queue pair with the
    /// negotiated depths: allocate and register the capsule arrays and post
    /// one two-entry RECV per slot.
    ///
    /// On any failure the partially built resources unwind through their
    /// own destructors.
    pub fn new(
        id: u64,
        qp: Box<dyn RdmaQp>,
        max_queue_depth: u16,
        max_rw_depth: u16,
        in_capsule_data_size: u32,
        max_io_size: u32,
    ) -> Result<Self> {
        debug_assert!(max_queue_depth > 0);
        debug_assert!(in_capsule_data_size > 0);
        let depth = max_queue_depth as usize;

        let cmds = Pinned::alloc(depth * CMD_CAPSULE_SIZE, CAPSULE_ARRAY_ALIGN)?;
        let cpls = Pinned::alloc(depth * RSP_CAPSULE_SIZE, CAPSULE_ARRAY_ALIGN)?;
        let bufs = Pinned::alloc(depth * in_capsule_data_size as usize, CAPSULE_ARRAY_ALIGN)?;

        // Safety: the arrays are pinned and dropped after the registrations.
        let cmds_mr = unsafe { qp.register(cmds.as_mut_ptr(), cmds.len())? };
        let cpls_mr = unsafe { qp.register(cpls.as_mut_ptr(), cpls.len())? };
        let bufs_mr = unsafe { qp.register(bufs.as_mut_ptr(), bufs.len())? };

        trace!(
            "conn {}: cmds {:#x} lkey {:#x}, cpls {:#x} lkey {:#x}, bufs {:#x} lkey {:#x}",
            id,
            cmds.addr(),
            cmds_mr.lkey(),
            cpls.addr(),
            cpls_mr.lkey(),
            bufs.addr(),
            bufs_mr.lkey()
        );

        let mut conn = Self {
            id,
            max_queue_depth,
            max_rw_depth,
            cur_queue_depth: 0,
            cur_rdma_rw_depth: 0,
            sq_head: 0,
            sq_head_max: max_queue_depth - 1,
            in_capsule_data_size,
            max_io_size,
            reqs: (0..depth).map(|_| RdmaRequest::new()).collect(),
            pending_data_buf_queue: VecDeque::new(),
            pending_rdma_rw_queue: VecDeque::new(),
            session: None,
            cmds_mr,
            cpls_mr,
            bufs_mr,
            qp,
            cmds,
            cpls,
            bufs,
        };

        for slot in 0..depth {
            conn.post_recv(slot)?;
        }

        debug!(
            "new RDMA connection {}: queue depth {}, rw depth {}",
            id, max_queue_depth, max_rw_depth
        );

        Ok(conn)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn max_queue_depth(&self) -> u16 {
        self.max_queue_depth
    }

    #[inline]
    pub fn max_rw_depth(&self) -> u16 {
        self.max_rw_depth
    }

    #[inline]
    pub fn cur_queue_depth(&self) -> u16 {
        self.cur_queue_depth
    }

    #[inline]
    pub fn cur_rdma_rw_depth(&self) -> u16 {
        self.cur_rdma_rw_depth
    }

    #[inline]
    pub fn sq_head(&self) -> u16 {
        self.sq_head
    }

    #[inline]
    pub fn sq_head_max(&self) -> u16 {
        self.sq_head_max
    }

    /// Set the submission queue wrap point (from the CONNECT sqsize).
    pub fn set_sq_head_max(&mut self, sq_head_max: u16) {
        self.sq_head_max = sq_head_max;
    }

    #[inline]
    pub fn in_capsule_data_size(&self) -> u32 {
        self.in_capsule_data_size
    }

    #[inline]
    pub fn pending_data_buf_len(&self) -> usize {
        self.pending_data_buf_queue.len()
    }

    #[inline]
    pub fn pending_rdma_rw_len(&self) -> usize {
        self.pending_rdma_rw_queue.len()
    }

    /// Head of the RW pending queue, if any.
    pub fn pending_rdma_rw_head(&self) -> Option<usize> {
        self.pending_rdma_rw_queue.front().copied()
    }

    pub fn req(&self, slot: usize) -> &RdmaRequest {
        &self.reqs[slot]
    }

    pub fn session(&self) -> Option<&Rc<RefCell<RdmaSession>>> {
        self.session.as_ref()
    }

    /// Bind this connection to its session. Later connections of a session
    /// share the first connection's pool.
    pub fn bind_session(&mut self, session: Rc<RefCell<RdmaSession>>) {
        self.session = Some(session);
    }

    pub fn unbind_session(&mut self) {
        self.session = None;
    }

    /// The queue pair, for registering session memory on this connection's
    /// device.
    pub fn qp(&self) -> &dyn RdmaQp {
        &*self.qp
    }

    /// Command capsule of a slot.
    pub fn cmd(&self, slot: usize) -> &NvmeCmd {
        debug_assert!(slot < self.reqs.len());
        unsafe { &*(self.cmds.as_ptr().add(slot * CMD_CAPSULE_SIZE) as *const NvmeCmd) }
    }

    /// Command capsule of a slot, writable (this is the RECV target the
    /// wire fills in).
    pub fn cmd_mut(&mut self, slot: usize) -> &mut NvmeCmd {
        debug_assert!(slot < self.reqs.len());
        unsafe { &mut *(self.cmds.as_mut_ptr().add(slot * CMD_CAPSULE_SIZE) as *mut NvmeCmd) }
    }

    /// Response capsule of a slot.
    pub fn rsp(&self, slot: usize) -> &NvmeCpl {
        debug_assert!(slot < self.reqs.len());
        unsafe { &*(self.cpls.as_ptr().add(slot * RSP_CAPSULE_SIZE) as *const NvmeCpl) }
    }

    pub fn rsp_mut(&mut self, slot: usize) -> &mut NvmeCpl {
        debug_assert!(slot < self.reqs.len());
        unsafe { &mut *(self.cpls.as_mut_ptr().add(slot * RSP_CAPSULE_SIZE) as *mut NvmeCpl) }
    }

    /// A slot's in-capsule data buffer.
    pub fn in_capsule_buf(&self, slot: usize) -> &[u8] {
        debug_assert!(slot < self.reqs.len());
        let icd = self.in_capsule_data_size as usize;
        unsafe { std::slice::from_raw_parts(self.bufs.as_ptr().add(slot * icd), icd) }
    }

    pub fn in_capsule_buf_mut(&mut self, slot: usize) -> &mut [u8] {
        debug_assert!(slot < self.reqs.len());
        let icd = self.in_capsule_data_size as usize;
        unsafe { std::slice::from_raw_parts_mut(self.bufs.as_mut_ptr().add(slot * icd), icd) }
    }

    /// Post the slot's RECV: a two-entry scatter of the command capsule and
    /// the in-capsule data buffer.
    fn post_recv(&mut self, slot: usize) -> Result<()> {
        let icd = self.in_capsule_data_size;
        let sg_list = [
            Sge {
                addr: self.cmds.addr() + (slot * CMD_CAPSULE_SIZE) as u64,
                length: CMD_CAPSULE_SIZE as u32,
                lkey: self.cmds_mr.lkey(),
            },
            Sge {
                addr: self.bufs.addr() + (slot as u64) * icd as u64,
                length: icd,
                lkey: self.bufs_mr.lkey(),
            },
        ];
        trace!("conn {}: RECV posted, slot {}", self.id, slot);
        self.qp.post_recv(slot as u64, &sg_list).map_err(|e| {
            error!("conn {}: failure posting recv: {}", self.id, e);
            Error::Io(e)
        })
    }

    /// The scatter entry covering a request's data.
    fn data_sge(&self, slot: usize) -> Result<Sge> {
        let req = &self.reqs[slot];
        match req.buf {
            ReqBuf::InCapsule { offset } => Ok(Sge {
                addr: self.bufs.addr()
                    + (slot as u64) * self.in_capsule_data_size as u64
                    + offset as u64,
                length: req.length,
                lkey: self.bufs_mr.lkey(),
            }),
            ReqBuf::Pool { chunk } => {
                let session = self.session.as_ref().ok_or(Error::NoSession)?;
                let session = session.borrow();
                Ok(Sge {
                    addr: session.pool().chunk_addr(chunk),
                    length: req.length,
                    lkey: session.pool().lkey(),
                })
            }
            ReqBuf::None => Err(Error::NoSession),
        }
    }

    /// Decode the freshly received capsule and stage its data buffer.
    fn prep_data(&mut self, slot: usize) -> PrepResult {
        let cmd = *self.cmd(slot);

        self.reqs[slot].length = 0;
        self.reqs[slot].buf = ReqBuf::None;
        self.reqs[slot].xfer = cmd.data_transfer();

        if self.reqs[slot].xfer == DataTransfer::None {
            return PrepResult::Ready;
        }

        match cmd.sgl1() {
            SglDescriptor::Keyed {
                address,
                length,
                key,
                subtype,
            } if subtype == SGL_SUBTYPE_ADDRESS || subtype == SGL_SUBTYPE_INVALIDATE_KEY => {
                if length > self.max_io_size {
                    error!(
                        "conn {}: SGL length {:#x} exceeds max io size {:#x}",
                        self.id, length, self.max_io_size
                    );
                    self.rsp_mut(slot).set_sc(SC_DATA_SGL_LENGTH_INVALID);
                    return PrepResult::Error;
                }

                if length == 0 {
                    self.reqs[slot].xfer = DataTransfer::None;
                    return PrepResult::Ready;
                }

                self.reqs[slot].length = length;
                self.reqs[slot].remote_addr = address;
                self.reqs[slot].remote_key = key;

                if length > self.in_capsule_data_size {
                    let chunk = self
                        .session
                        .as_ref()
                        .and_then(|sess| sess.borrow_mut().pool_mut().acquire());
                    match chunk {
                        Some(chunk) => {
                            trace!("conn {}: slot {} took pool chunk {}", self.id, slot, chunk);
                            self.reqs[slot].buf = ReqBuf::Pool { chunk };
                        }
                        None => {
                            trace!(
                                "conn {}: no large data buffers, queueing slot {}",
                                self.id,
                                slot
                            );
                            return PrepResult::PendingBuffer;
                        }
                    }
                } else {
                    // The in-capsule buffer doubles as bounce space for
                    // small keyed transfers.
                    self.reqs[slot].buf = ReqBuf::InCapsule { offset: 0 };
                }

                if self.reqs[slot].xfer == DataTransfer::HostToController {
                    PrepResult::PendingData
                } else {
                    PrepResult::Ready
                }
            }
            SglDescriptor::Unkeyed {
                address: offset,
                length,
                subtype,
            } if subtype == SGL_SUBTYPE_OFFSET => {
                let max_len = self.in_capsule_data_size as u64;
                if offset > max_len {
                    error!(
                        "conn {}: in-capsule offset {:#x} exceeds capsule length {:#x}",
                        self.id, offset, max_len
                    );
                    self.rsp_mut(slot).set_sc(SC_INVALID_SGL_OFFSET);
                    return PrepResult::Error;
                }
                let max_len = (max_len - offset) as u32;

                if length > max_len {
                    error!(
                        "conn {}: in-capsule data length {:#x} exceeds capsule length {:#x}",
                        self.id, length, max_len
                    );
                    self.rsp_mut(slot).set_sc(SC_DATA_SGL_LENGTH_INVALID);
                    return PrepResult::Error;
                }

                if length == 0 {
                    self.reqs[slot].xfer = DataTransfer::None;
                    return PrepResult::Ready;
                }

                self.reqs[slot].buf = ReqBuf::InCapsule {
                    offset: offset as u32,
                };
                self.reqs[slot].length = length;
                PrepResult::Ready
            }
            other => {
                error!("conn {}: invalid I/O command SGL: {:?}", self.id, other);
                self.rsp_mut(slot).set_sc(SC_SGL_DESCRIPTOR_TYPE_INVALID);
                PrepResult::Error
            }
        }
    }

    /// Post the RDMA READ (host-to-controller) or WRITE (controller-to-host)
    /// for a request holding a data buffer, or park it on the RW pending
    /// queue when no credit is available.
    fn transfer_data(&mut self, slot: usize) -> Result<()> {
        debug_assert!(self.reqs[slot].xfer != DataTransfer::None);

        if self.cur_rdma_rw_depth < self.max_rw_depth {
            let sge = self.data_sge(slot)?;
            let (remote_addr, remote_key) =
                (self.reqs[slot].remote_addr, self.reqs[slot].remote_key);
            match self.reqs[slot].xfer {
                DataTransfer::ControllerToHost => {
                    trace!("conn {}: RDMA WRITE posted, slot {}", self.id, slot);
                    self.qp
                        .post_rdma_write(slot as u64, sge, remote_addr, remote_key)
                        .map_err(|e| {
                            error!("conn {}: failure posting rdma write: {}", self.id, e);
                            Error::Io(e)
                        })?;
                }
                DataTransfer::HostToController => {
                    trace!("conn {}: RDMA READ posted, slot {}", self.id, slot);
                    self.qp
                        .post_rdma_read(slot as u64, sge, remote_addr, remote_key)
                        .map_err(|e| {
                            error!("conn {}: failure posting rdma read: {}", self.id, e);
                            Error::Io(e)
                        })?;
                }
                _ => {}
            }
            self.cur_rdma_rw_depth += 1;
            self.reqs[slot].state = ReqState::RwPosted;
        } else {
            self.pending_rdma_rw_queue.push_back(slot);
            self.reqs[slot].state = ReqState::WaitRw;
        }

        Ok(())
    }

    /// Step 2: return any borrowed chunk, advance `sq_head`, stamp `sqhd`,
    /// re-post the RECV, and send the completion capsule.
    fn send_completion(&mut self, slot: usize) -> Result<()> {
        if let ReqBuf::Pool { chunk } = self.reqs[slot].buf {
            let session = self.session.as_ref().ok_or(Error::NoSession)?;
            session.borrow_mut().pool_mut().release(chunk);
            self.reqs[slot].buf = ReqBuf::None;
            self.reqs[slot].length = 0;
        }

        self.sq_head = if self.sq_head == self.sq_head_max {
            0
        } else {
            self.sq_head + 1
        };
        let sq_head = self.sq_head;
        self.rsp_mut(slot).sqhd = sq_head;

        self.post_recv(slot)?;

        let sge = Sge {
            addr: self.cpls.addr() + (slot * RSP_CAPSULE_SIZE) as u64,
            length: RSP_CAPSULE_SIZE as u32,
            lkey: self.cpls_mr.lkey(),
        };
        trace!("conn {}: SEND posted, slot {}", self.id, slot);
        self.qp.post_send(slot as u64, sge).map_err(|e| {
            error!("conn {}: failure sending response capsule: {}", self.id, e);
            Error::Io(e)
        })?;
        self.reqs[slot].state = ReqState::SendPosted;

        Ok(())
    }

    /// Step 3: the completion SEND was acknowledged by the wire.
    fn ack_completion(&mut self, slot: usize) -> Result<()> {
        self.sq_head = if self.sq_head == self.sq_head_max {
            0
        } else {
            self.sq_head + 1
        };

        debug_assert!(self.cur_queue_depth > 0);
        self.cur_queue_depth -= 1;
        self.reqs[slot].state = ReqState::Posted;

        Ok(())
    }

    /// Backend reports completion: transfer data back for successful
    /// controller-to-host requests, otherwise go straight to the
    /// completion SEND.
    pub fn req_complete(&mut self, slot: usize) -> Result<()> {
        debug_assert!(slot < self.reqs.len());
        if self.rsp(slot).sc() == SC_SUCCESS
            && self.reqs[slot].xfer == DataTransfer::ControllerToHost
        {
            self.transfer_data(slot)
        } else {
            self.send_completion(slot)
        }
    }

    /// Backend drops the request without a wire completion of its own:
    /// skip straight to the acknowledgement step.
    pub fn req_release(&mut self, slot: usize) -> Result<()> {
        debug_assert!(slot < self.reqs.len());
        self.ack_completion(slot)
    }

    /// Hand a prepared request to the backend.
    fn execute(&mut self, slot: usize, backend: &mut dyn NvmfBackend) -> Result<()> {
        self.reqs[slot].state = ReqState::Executing;
        let xfer = self.reqs[slot].xfer;
        let length = self.reqs[slot].length;

        let data = match self.reqs[slot].buf {
            ReqBuf::None => None,
            ReqBuf::InCapsule { offset } => {
                let icd = self.in_capsule_data_size as usize;
                let ptr = unsafe {
                    self.bufs
                        .as_mut_ptr()
                        .add(slot * icd + offset as usize)
                };
                Some((ptr, length as usize))
            }
            ReqBuf::Pool { chunk } => {
                let session = self.session.as_ref().ok_or(Error::NoSession)?;
                let ptr = session.borrow().pool().chunk_ptr(chunk);
                Some((ptr, length as usize))
            }
        };

        // The capsule arrays and data buffers are disjoint pinned
        // allocations; the views below do not alias.
        let cmd =
            unsafe { &*(self.cmds.as_ptr().add(slot * CMD_CAPSULE_SIZE) as *const NvmeCmd) };
        let rsp =
            unsafe { &mut *(self.cpls.as_mut_ptr().add(slot * RSP_CAPSULE_SIZE) as *mut NvmeCpl) };
        let data = data.map(|(ptr, len)| unsafe { std::slice::from_raw_parts_mut(ptr, len) });

        backend.execute(ExecutingRequest {
            slot,
            cmd,
            rsp,
            data,
            xfer,
            length,
        })
    }

    /// After an RW credit or a pool chunk frees up: first marry free chunks
    /// to buffer-waiters, then post RW work while credits remain. Returns
    /// how many requests reached the backend.
    fn handle_pending(&mut self, backend: &mut dyn NvmfBackend) -> Result<usize> {
        let mut count = 0;

        if let Some(session) = self.session.clone() {
            while let Some(&slot) = self.pending_data_buf_queue.front() {
                let chunk = match session.borrow_mut().pool_mut().acquire() {
                    Some(chunk) => chunk,
                    None => break,
                };
                self.pending_data_buf_queue.pop_front();
                debug_assert!(self.reqs[slot].buf == ReqBuf::None);
                self.reqs[slot].buf = ReqBuf::Pool { chunk };

                if self.reqs[slot].xfer == DataTransfer::HostToController {
                    self.pending_rdma_rw_queue.push_back(slot);
                    self.reqs[slot].state = ReqState::WaitRw;
                } else {
                    self.execute(slot, backend)?;
                    count += 1;
                }
            }
        }

        while self.cur_rdma_rw_depth < self.max_rw_depth {
            let Some(slot) = self.pending_rdma_rw_queue.pop_front() else {
                break;
            };
            trace!(
                "conn {}: submitting previously queued RW for slot {}",
                self.id,
                slot
            );
            self.transfer_data(slot)?;
        }

        Ok(count)
    }

    /// Poll both completion queues once. Returns the number of backend
    /// invocations; an error means the connection is broken and must be
    /// destroyed by the caller.
    pub fn poll(&mut self, backend: &mut dyn NvmfBackend) -> Result<usize> {
        let mut count = 0;

        // Completions for work the target initiated.
        loop {
            let Some(wc) = self.qp.poll_send_cq().map_err(|e| {
                error!("conn {}: error polling send CQ: {}", self.id, e);
                Error::Io(e)
            })?
            else {
                break;
            };

            if !wc.is_success() {
                error!(
                    "conn {}: send CQ error on request {}: {}",
                    self.id,
                    wc.wr_id,
                    rdmacm::types::wc_status_str(wc.status)
                );
                return Err(Error::WorkCompletion {
                    wr_id: wc.wr_id,
                    status: wc.status,
                });
            }

            let slot = wc.wr_id as usize;
            if slot >= self.reqs.len() {
                return Err(Error::InvalidWrId(wc.wr_id));
            }

            match wc.opcode {
                WcOpcode::Send => {
                    trace!(
                        "conn {}: SEND complete, slot {}, outstanding {}",
                        self.id,
                        slot,
                        self.cur_queue_depth.saturating_sub(1)
                    );
                    self.ack_completion(slot)?;
                }
                WcOpcode::RdmaWrite => {
                    trace!("conn {}: RDMA WRITE complete, slot {}", self.id, slot);
                    self.send_completion(slot)?;
                    self.cur_rdma_rw_depth -= 1;
                    count += self.handle_pending(backend)?;
                }
                WcOpcode::RdmaRead => {
                    trace!("conn {}: RDMA READ complete, slot {}", self.id, slot);
                    self.execute(slot, backend)?;
                    count += 1;
                    self.cur_rdma_rw_depth -= 1;
                    count += self.handle_pending(backend)?;
                }
                WcOpcode::Recv => {
                    error!("conn {}: RECV completion on the send CQ", self.id);
                    return Err(Error::UnexpectedOpcode {
                        opcode: 1 << 7,
                        queue: "send",
                    });
                }
                WcOpcode::Other(opcode) => {
                    error!("conn {}: unknown opcode {} on the send CQ", self.id, opcode);
                    return Err(Error::UnexpectedOpcode {
                        opcode,
                        queue: "send",
                    });
                }
            }
        }

        // Incoming capsules, bounded by the negotiated queue depth.
        while self.cur_queue_depth < self.max_queue_depth {
            let Some(wc) = self.qp.poll_recv_cq().map_err(|e| {
                error!("conn {}: error polling recv CQ: {}", self.id, e);
                Error::Io(e)
            })?
            else {
                break;
            };

            if !wc.is_success() {
                error!(
                    "conn {}: recv CQ error: {}",
                    self.id,
                    rdmacm::types::wc_status_str(wc.status)
                );
                return Err(Error::WorkCompletion {
                    wr_id: wc.wr_id,
                    status: wc.status,
                });
            }

            let slot = wc.wr_id as usize;
            if slot >= self.reqs.len() {
                return Err(Error::InvalidWrId(wc.wr_id));
            }

            match wc.opcode {
                WcOpcode::Recv => {
                    if wc.byte_len < CMD_CAPSULE_SIZE as u32 {
                        error!(
                            "conn {}: recv length {} less than capsule header",
                            self.id, wc.byte_len
                        );
                        return Err(Error::ShortCapsule {
                            byte_len: wc.byte_len,
                        });
                    }

                    self.cur_queue_depth += 1;
                    trace!(
                        "conn {}: RECV complete, slot {}, outstanding {}",
                        self.id,
                        slot,
                        self.cur_queue_depth
                    );

                    self.rsp_mut(slot).clear();
                    match self.prep_data(slot) {
                        PrepResult::Ready => {
                            self.execute(slot, backend)?;
                            count += 1;
                        }
                        PrepResult::PendingBuffer => {
                            self.pending_data_buf_queue.push_back(slot);
                            self.reqs[slot].state = ReqState::WaitBuf;
                        }
                        PrepResult::PendingData => {
                            self.transfer_data(slot)?;
                        }
                        PrepResult::Error => {
                            self.req_complete(slot)?;
                        }
                    }
                }
                WcOpcode::Send | WcOpcode::RdmaWrite | WcOpcode::RdmaRead => {
                    error!(
                        "conn {}: send/write/read completion on the recv CQ",
                        self.id
                    );
                    return Err(Error::UnexpectedOpcode {
                        opcode: 0,
                        queue: "recv",
                    });
                }
                WcOpcode::Other(opcode) => {
                    error!("conn {}: unknown opcode {} on the recv CQ", self.id, opcode);
                    return Err(Error::UnexpectedOpcode {
                        opcode,
                        queue: "recv",
                    });
                }
            }
        }

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockQp;

    fn new_conn(depth: u16, rw_depth: u16) -> (RdmaConn, MockQp) {
        let qp = MockQp::new();
        let conn = RdmaConn::new(7, Box::new(qp.clone()), depth, rw_depth, 4096, 128 * 1024)
            .unwrap();
        (conn, qp)
    }

    #[test]
    fn construction_posts_one_recv_per_slot() {
        let (conn, qp) = new_conn(8, 4);
        assert_eq!(qp.recv_count(), 8);
        assert_eq!(conn.cur_queue_depth(), 0);
        // Each RECV scatters into the capsule and the in-capsule buffer.
        let recv = qp.last_recv().unwrap();
        assert_eq!(recv.sg_list.len(), 2);
        assert_eq!(recv.sg_list[0].length, CMD_CAPSULE_SIZE as u32);
        assert_eq!(recv.sg_list[1].length, 4096);
    }

    #[test]
    fn slot_states_start_posted() {
        let (conn, _qp) = new_conn(4, 2);
        for slot in 0..4 {
            assert_eq!(conn.req(slot).state(), ReqState::Posted);
        }
    }
}
