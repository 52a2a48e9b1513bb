//! Safe wrappers over librdmacm connection management and the verbs data
//! path.
//!
//! The crate covers the slice of rdma-core a connection-oriented target
//! needs: device enumeration, the CM event channel and ids, queue-pair
//! creation through `rdma_create_qp`, memory registration, work-request
//! posting and completion-queue polling. Resources are RAII handles holding
//! `NonNull` pointers; every fallible FFI edge returns `io::Result` with the
//! thread errno.

pub mod device;
pub mod event;
pub mod id;
pub mod mr;
pub mod types;

pub use device::{Context, Device, DeviceAttr, DeviceList};
pub use event::{CmEvent, CmEventType, EventChannel};
pub use id::CmId;
pub use mr::{AccessFlags, MemoryRegion};
pub use types::{ConnParams, QpCaps, Sge, WcOpcode, WorkCompletion};
