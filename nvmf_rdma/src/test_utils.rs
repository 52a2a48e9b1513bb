//! Test doubles for driving the request pipeline without RDMA hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use crate::capsule::DataTransfer;
use crate::qp::{RdmaQp, RegionHandle, Registration, Sge, WcOpcode, WorkCompletion};
use crate::request::{ExecutingRequest, NvmfBackend};
use crate::transport::DisconnectDispatcher;

#[derive(Debug, Clone)]
pub struct PostedRecv {
    pub wr_id: u64,
    pub sg_list: Vec<Sge>,
}

#[derive(Debug, Clone)]
pub struct PostedSend {
    pub wr_id: u64,
    pub sge: Sge,
}

#[derive(Debug, Clone)]
pub struct PostedRdma {
    pub wr_id: u64,
    pub sge: Sge,
    pub remote_addr: u64,
    pub rkey: u32,
}

#[derive(Default)]
struct MockQpState {
    next_key: u32,
    recvs: Vec<PostedRecv>,
    sends: Vec<PostedSend>,
    reads: Vec<PostedRdma>,
    writes: Vec<PostedRdma>,
    send_cq: VecDeque<WorkCompletion>,
    recv_cq: VecDeque<WorkCompletion>,
}

/// In-memory queue pair: records every posted work request and replays
/// completions injected by the test. Clones share state, so a test can keep
/// a handle while the connection owns the boxed copy.
#[derive(Clone, Default)]
pub struct MockQp {
    state: Rc<RefCell<MockQpState>>,
}

struct StubRegion {
    lkey: u32,
    rkey: u32,
}

impl RegionHandle for StubRegion {
    fn lkey(&self) -> u32 {
        self.lkey
    }

    fn rkey(&self) -> u32 {
        self.rkey
    }
}

impl MockQp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recv_count(&self) -> usize {
        self.state.borrow().recvs.len()
    }

    pub fn send_count(&self) -> usize {
        self.state.borrow().sends.len()
    }

    pub fn read_count(&self) -> usize {
        self.state.borrow().reads.len()
    }

    pub fn write_count(&self) -> usize {
        self.state.borrow().writes.len()
    }

    pub fn last_recv(&self) -> Option<PostedRecv> {
        self.state.borrow().recvs.last().cloned()
    }

    pub fn last_send(&self) -> Option<PostedSend> {
        self.state.borrow().sends.last().cloned()
    }

    pub fn last_read(&self) -> Option<PostedRdma> {
        self.state.borrow().reads.last().cloned()
    }

    pub fn last_write(&self) -> Option<PostedRdma> {
        self.state.borrow().writes.last().cloned()
    }

    pub fn reads(&self) -> Vec<PostedRdma> {
        self.state.borrow().reads.clone()
    }

    pub fn writes(&self) -> Vec<PostedRdma> {
        self.state.borrow().writes.clone()
    }

    /// Inject a successful RECV completion for `wr_id` delivering
    /// `byte_len` bytes.
    pub fn complete_recv(&self, wr_id: u64, byte_len: u32) {
        self.state.borrow_mut().recv_cq.push_back(WorkCompletion {
            wr_id,
            status: 0,
            opcode: WcOpcode::Recv,
            byte_len,
        });
    }

    pub fn complete_send(&self, wr_id: u64) {
        self.push_send_wc(WorkCompletion {
            wr_id,
            status: 0,
            opcode: WcOpcode::Send,
            byte_len: 0,
        });
    }

    pub fn complete_read(&self, wr_id: u64) {
        self.push_send_wc(WorkCompletion {
            wr_id,
            status: 0,
            opcode: WcOpcode::RdmaRead,
            byte_len: 0,
        });
    }

    pub fn complete_write(&self, wr_id: u64) {
        self.push_send_wc(WorkCompletion {
            wr_id,
            status: 0,
            opcode: WcOpcode::RdmaWrite,
            byte_len: 0,
        });
    }

    /// Push a raw completion onto the send CQ (for error injection).
    pub fn push_send_wc(&self, wc: WorkCompletion) {
        self.state.borrow_mut().send_cq.push_back(wc);
    }

    /// Push a raw completion onto the recv CQ.
    pub fn push_recv_wc(&self, wc: WorkCompletion) {
        self.state.borrow_mut().recv_cq.push_back(wc);
    }
}

impl RdmaQp for MockQp {
    unsafe fn register(&self, _addr: *mut u8, _len: usize) -> io::Result<Registration> {
        let mut state = self.state.borrow_mut();
        state.next_key += 2;
        Ok(Box::new(StubRegion {
            lkey: state.next_key - 2,
            rkey: state.next_key - 1,
        }))
    }

    fn post_recv(&mut self, wr_id: u64, sg_list: &[Sge]) -> io::Result<()> {
        self.state.borrow_mut().recvs.push(PostedRecv {
            wr_id,
            sg_list: sg_list.to_vec(),
        });
        Ok(())
    }

    fn post_send(&mut self, wr_id: u64, sge: Sge) -> io::Result<()> {
        self.state.borrow_mut().sends.push(PostedSend { wr_id, sge });
        Ok(())
    }

    fn post_rdma_read(
        &mut self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.state.borrow_mut().reads.push(PostedRdma {
            wr_id,
            sge,
            remote_addr,
            rkey,
        });
        Ok(())
    }

    fn post_rdma_write(
        &mut self,
        wr_id: u64,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
    ) -> io::Result<()> {
        self.state.borrow_mut().writes.push(PostedRdma {
            wr_id,
            sge,
            remote_addr,
            rkey,
        });
        Ok(())
    }

    fn poll_send_cq(&mut self) -> io::Result<Option<WorkCompletion>> {
        Ok(self.state.borrow_mut().send_cq.pop_front())
    }

    fn poll_recv_cq(&mut self) -> io::Result<Option<WorkCompletion>> {
        Ok(self.state.borrow_mut().recv_cq.pop_front())
    }
}

/// What the mock backend saw for one execution.
#[derive(Debug, Clone)]
pub struct ExecutedRequest {
    pub slot: usize,
    pub xfer: DataTransfer,
    pub length: u32,
    pub cid: u16,
    pub had_data: bool,
}

/// Backend double: records executions and echoes the command id into the
/// response, leaving the status at success. Tests complete requests later
/// through `req_complete`.
#[derive(Default)]
pub struct MockBackend {
    pub executed: Vec<ExecutedRequest>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvmfBackend for MockBackend {
    fn execute(&mut self, req: ExecutingRequest<'_>) -> crate::Result<()> {
        req.rsp.cid = req.cmd.cid;
        self.executed.push(ExecutedRequest {
            slot: req.slot,
            xfer: req.xfer,
            length: req.length,
            cid: req.cmd.cid,
            had_data: req.data.is_some(),
        });
        Ok(())
    }
}

/// Dispatcher double recording `(executor, conn_id)` pairs.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    pub dispatched: Rc<RefCell<Vec<(u32, u64)>>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisconnectDispatcher for RecordingDispatcher {
    fn dispatch(&self, executor: u32, conn_id: u64) {
        self.dispatched.borrow_mut().push((executor, conn_id));
    }
}
