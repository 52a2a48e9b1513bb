//! Error types for the RDMA transport.

use std::io;

/// Transport-fatal errors. Malformed capsules that can be answered with an
/// NVMe status are not errors; they travel back in the completion capsule.
#[derive(Debug)]
pub enum Error {
    /// IO error from the CM or verbs layer.
    Io(io::Error),
    /// A work completion came back with a non-zero status.
    WorkCompletion { wr_id: u64, status: u32 },
    /// A completion carried an opcode the queue should never produce.
    UnexpectedOpcode { opcode: u32, queue: &'static str },
    /// A completion referenced a work request cookie outside the slot array.
    InvalidWrId(u64),
    /// A RECV completed with fewer bytes than a command capsule header.
    ShortCapsule { byte_len: u32 },
    /// A request needed the session buffer pool before a session was bound.
    NoSession,
    /// The backend failed to take the request.
    Backend(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::WorkCompletion { wr_id, status } => {
                write!(
                    f,
                    "work completion error on request {}: {} ({})",
                    wr_id,
                    rdmacm::types::wc_status_str(*status),
                    status
                )
            }
            Error::UnexpectedOpcode { opcode, queue } => {
                write!(f, "unexpected opcode {} on the {} CQ", opcode, queue)
            }
            Error::InvalidWrId(wr_id) => write!(f, "work completion for unknown wr_id {}", wr_id),
            Error::ShortCapsule { byte_len } => {
                write!(f, "recv length {} less than capsule header", byte_len)
            }
            Error::NoSession => write!(f, "no session bound to connection"),
            Error::Backend(msg) => write!(f, "backend execution failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
