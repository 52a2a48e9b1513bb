//! RDMA transport for an NVMe-over-Fabrics target.
//!
//! The transport accepts RDMA CM connections from NVMe-oF hosts, negotiates
//! per-queue resources, receives command capsules over a Reliable
//! Connection, moves data with RDMA READ/WRITE, and returns completion
//! capsules.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     RdmaTransport                             │
//! │  CM event channel ── listener id ── pending connections       │
//! └───────────────────────────────────────────────────────────────┘
//!               │ CONNECT_REQUEST: negotiate + accept
//!               ▼
//!     ┌──────────────────┐      ┌──────────────────┐
//!     │    RdmaConn      │ ...  │    RdmaConn      │   one executor each
//!     │  RC QP, capsule  │      │                  │
//!     │  arrays, slots   │      │                  │
//!     └──────────────────┘      └──────────────────┘
//!               │ slots borrow large buffers from
//!               ▼
//!     ┌──────────────────┐
//!     │   RdmaSession    │   one pinned pool per session,
//!     │   DataBufPool    │   registered once
//!     └──────────────────┘
//! ```
//!
//! Each request slot runs a fixed pipeline: RECV completes with a capsule,
//! prep decodes the SGL, data moves to or from the host when needed, the
//! backend executes the command, and the 16-byte completion goes back with a
//! SEND. Two credit counters bound the work in flight: the submission queue
//! depth and the number of posted RDMA READ/WRITE operations. Exhausted
//! credits and exhausted pool buffers park the slot on a pending queue; the
//! per-connection poll drains those queues as completions free resources.
//!
//! Everything on a connection is single-threaded: the owning executor calls
//! [`RdmaConn::poll`], nothing blocks, and the CM acceptor runs on its own
//! executor, handing disconnects across cores through a
//! [`DisconnectDispatcher`].

pub mod acceptor;
pub mod capsule;
pub mod config;
pub mod conn;
pub mod discovery;
pub mod error;
pub mod mem;
pub mod pool;
pub mod qp;
pub mod request;
pub mod test_utils;
pub mod transport;
pub mod verbs;

pub use capsule::{DataTransfer, NvmeCmd, NvmeCpl, SglDescriptor};
pub use config::RdmaTransportConfig;
pub use conn::RdmaConn;
pub use discovery::{DiscoveryLogEntry, ListenAddr};
pub use error::{Error, Result};
pub use pool::{DataBufPool, RdmaSession};
pub use qp::{RdmaQp, RegionHandle, Registration};
pub use request::{ExecutingRequest, NvmfBackend, ReqBuf, ReqState};
pub use transport::{DisconnectDispatcher, FabricTransport, RdmaTransport};
