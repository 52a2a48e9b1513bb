//! Per-slot request state and the backend execution contract.

use crate::capsule::{DataTransfer, NvmeCmd, NvmeCpl};
use crate::error::Result;

/// Where a request slot is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    /// Slot posted for RECV, waiting for a capsule.
    Posted,
    /// Waiting for a session pool chunk.
    WaitBuf,
    /// Waiting for an RDMA READ/WRITE credit.
    WaitRw,
    /// An RDMA READ or WRITE is outstanding.
    RwPosted,
    /// Handed to the backend; completion pending.
    Executing,
    /// The completion SEND is outstanding.
    SendPosted,
}

/// The data buffer a request is using.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqBuf {
    None,
    /// The slot's in-capsule data buffer, starting at `offset`.
    InCapsule { offset: u32 },
    /// A chunk borrowed from the session pool.
    Pool { chunk: usize },
}

/// Outcome of decoding a freshly received capsule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrepResult {
    /// Data (if any) is in place; execute now.
    Ready,
    /// Needs a session pool chunk; none available.
    PendingBuffer,
    /// Needs a host-to-controller transfer before execution.
    PendingData,
    /// Malformed; the completion capsule already carries the status.
    Error,
}

/// One request slot. The slot index doubles as the `wr_id` cookie on every
/// work request the slot posts.
pub struct RdmaRequest {
    pub(crate) state: ReqState,
    pub(crate) xfer: DataTransfer,
    pub(crate) length: u32,
    pub(crate) buf: ReqBuf,
    /// Host memory address from the keyed SGL.
    pub(crate) remote_addr: u64,
    /// Host memory key from the keyed SGL.
    pub(crate) remote_key: u32,
}

impl RdmaRequest {
    pub(crate) fn new() -> Self {
        Self {
            state: ReqState::Posted,
            xfer: DataTransfer::None,
            length: 0,
            buf: ReqBuf::None,
            remote_addr: 0,
            remote_key: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> ReqState {
        self.state
    }

    #[inline]
    pub fn xfer(&self) -> DataTransfer {
        self.xfer
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    pub fn buf(&self) -> ReqBuf {
        self.buf
    }
}

/// Borrowed view of a prepared request, handed to the backend.
///
/// The backend fills the response's status fields and later reports
/// completion through `req_complete` (or `req_release`) on the owning
/// connection, quoting `slot`.
pub struct ExecutingRequest<'a> {
    /// Slot index; the handle for the eventual completion call.
    pub slot: usize,
    pub cmd: &'a NvmeCmd,
    pub rsp: &'a mut NvmeCpl,
    /// Request data: in-capsule bytes or the borrowed pool chunk.
    pub data: Option<&'a mut [u8]>,
    pub xfer: DataTransfer,
    pub length: u32,
}

/// The command-execution layer above the transport.
pub trait NvmfBackend {
    /// Take ownership of a prepared request. The call must not block; the
    /// request completes later via the connection's completion entry
    /// points. An error is fatal to the connection.
    fn execute(&mut self, req: ExecutingRequest<'_>) -> Result<()>;
}
