//! CM event channel and events.

use std::{io, ptr::NonNull, slice};

use crate::types::ConnParams;

/// Connection-management event types a listener cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventType {
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    AddrChange,
    TimewaitExit,
    Other(u32),
}

impl From<u32> for CmEventType {
    fn from(raw: u32) -> Self {
        match raw {
            rdmacm_sys::RDMA_CM_EVENT_CONNECT_REQUEST => CmEventType::ConnectRequest,
            rdmacm_sys::RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventType::ConnectResponse,
            rdmacm_sys::RDMA_CM_EVENT_CONNECT_ERROR => CmEventType::ConnectError,
            rdmacm_sys::RDMA_CM_EVENT_UNREACHABLE => CmEventType::Unreachable,
            rdmacm_sys::RDMA_CM_EVENT_REJECTED => CmEventType::Rejected,
            rdmacm_sys::RDMA_CM_EVENT_ESTABLISHED => CmEventType::Established,
            rdmacm_sys::RDMA_CM_EVENT_DISCONNECTED => CmEventType::Disconnected,
            rdmacm_sys::RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventType::DeviceRemoval,
            rdmacm_sys::RDMA_CM_EVENT_ADDR_CHANGE => CmEventType::AddrChange,
            rdmacm_sys::RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventType::TimewaitExit,
            other => CmEventType::Other(other),
        }
    }
}

/// Asynchronous CM event channel. Destroyed when dropped; all ids created on
/// the channel must be destroyed first.
pub struct EventChannel {
    chan: NonNull<rdmacm_sys::rdma_event_channel>,
}

impl EventChannel {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let chan = rdmacm_sys::rdma_create_event_channel();
            NonNull::new(chan).map_or(Err(io::Error::last_os_error()), |chan| Ok(Self { chan }))
        }
    }

    /// Switch the channel fd to non-blocking so `poll_event` never stalls.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = unsafe { (*self.chan.as_ptr()).fd };
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Fetch the next CM event, or `None` when the channel is drained.
    pub fn poll_event(&self) -> io::Result<Option<CmEvent>> {
        unsafe {
            let mut event = std::ptr::null_mut();
            let rc = rdmacm_sys::rdma_get_cm_event(self.chan.as_ptr(), &mut event);
            if rc != 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => Ok(None),
                    _ => Err(err),
                };
            }
            match NonNull::new(event) {
                Some(event) => Ok(Some(CmEvent {
                    event,
                    acked: false,
                })),
                None => Ok(None),
            }
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut rdmacm_sys::rdma_event_channel {
        self.chan.as_ptr()
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        unsafe {
            rdmacm_sys::rdma_destroy_event_channel(self.chan.as_ptr());
        }
    }
}

/// A fetched CM event. The event (and any private data borrowed from it)
/// stays valid until acknowledged; dropping an unacked event acks it.
pub struct CmEvent {
    event: NonNull<rdmacm_sys::rdma_cm_event>,
    acked: bool,
}

impl CmEvent {
    pub fn event_type(&self) -> CmEventType {
        CmEventType::from(unsafe { (*self.event.as_ptr()).event })
    }

    pub fn status(&self) -> i32 {
        unsafe { (*self.event.as_ptr()).status }
    }

    /// Raw id the event refers to. For CONNECT_REQUEST this is the new
    /// child id whose ownership passes to the callee.
    pub fn id_raw(&self) -> *mut rdmacm_sys::rdma_cm_id {
        unsafe { (*self.event.as_ptr()).id }
    }

    /// The opaque context value stored on the event's id.
    pub fn id_context(&self) -> u64 {
        unsafe {
            let id = (*self.event.as_ptr()).id;
            if id.is_null() {
                0
            } else {
                (*id).context as usize as u64
            }
        }
    }

    /// Connection parameters offered by the remote peer.
    pub fn conn_params(&self) -> ConnParams {
        unsafe { ConnParams::from_raw(&(*self.event.as_ptr()).param.conn) }
    }

    /// Private data attached to the connection request, if any.
    pub fn private_data(&self) -> Option<&[u8]> {
        unsafe {
            let conn = &(*self.event.as_ptr()).param.conn;
            if conn.private_data.is_null() || conn.private_data_len == 0 {
                None
            } else {
                Some(slice::from_raw_parts(
                    conn.private_data as *const u8,
                    conn.private_data_len as usize,
                ))
            }
        }
    }

    /// Acknowledge and release the event.
    pub fn ack(mut self) -> io::Result<()> {
        self.ack_inner()
    }

    fn ack_inner(&mut self) -> io::Result<()> {
        if self.acked {
            return Ok(());
        }
        self.acked = true;
        let rc = unsafe { rdmacm_sys::rdma_ack_cm_event(self.event.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for CmEvent {
    fn drop(&mut self) {
        let _ = self.ack_inner();
    }
}
