//! Plain data types shared between the CM layer and its callers.

use std::ffi::CStr;

/// Scatter/gather entry for a work request.
#[derive(Debug, Clone, Copy)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Queue pair capacity limits passed to `rdma_create_qp`.
#[derive(Debug, Clone, Copy)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
}

/// Connection parameters carried by CONNECT_REQUEST events and echoed back
/// on accept. Private data travels separately as a byte slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnParams {
    pub responder_resources: u8,
    pub initiator_depth: u8,
    pub flow_control: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub srq: u8,
    pub qp_num: u32,
}

impl ConnParams {
    pub(crate) fn from_raw(raw: &rdmacm_sys::rdma_conn_param) -> Self {
        Self {
            responder_resources: raw.responder_resources,
            initiator_depth: raw.initiator_depth,
            flow_control: raw.flow_control,
            retry_count: raw.retry_count,
            rnr_retry_count: raw.rnr_retry_count,
            srq: raw.srq,
            qp_num: raw.qp_num,
        }
    }
}

/// Work completion opcode, collapsed to the operations a connected QP
/// produces. All RECV flavors (bit 7) map to `Recv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    Other(u32),
}

impl From<u32> for WcOpcode {
    fn from(raw: u32) -> Self {
        if raw & rdmacm_sys::IBV_WC_RECV != 0 {
            return WcOpcode::Recv;
        }
        match raw {
            rdmacm_sys::IBV_WC_SEND => WcOpcode::Send,
            rdmacm_sys::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
            rdmacm_sys::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            other => WcOpcode::Other(other),
        }
    }
}

/// Harvested work completion.
#[derive(Debug, Clone, Copy)]
pub struct WorkCompletion {
    /// Cookie attached when the work request was posted.
    pub wr_id: u64,
    /// Raw `ibv_wc_status`; zero means success.
    pub status: u32,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

impl WorkCompletion {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == rdmacm_sys::IBV_WC_SUCCESS
    }

    pub(crate) fn from_raw(wc: &rdmacm_sys::ibv_wc) -> Self {
        Self {
            wr_id: wc.wr_id,
            status: wc.status,
            opcode: WcOpcode::from(wc.opcode),
            byte_len: wc.byte_len,
        }
    }
}

/// Human-readable name for a work completion status.
pub fn wc_status_str(status: u32) -> String {
    unsafe {
        let s = rdmacm_sys::ibv_wc_status_str(status);
        if s.is_null() {
            format!("unknown status {}", status)
        } else {
            CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wc_opcode_mapping() {
        assert_eq!(WcOpcode::from(0), WcOpcode::Send);
        assert_eq!(WcOpcode::from(1), WcOpcode::RdmaWrite);
        assert_eq!(WcOpcode::from(2), WcOpcode::RdmaRead);
        assert_eq!(WcOpcode::from(1 << 7), WcOpcode::Recv);
        assert_eq!(WcOpcode::from((1 << 7) | 1), WcOpcode::Recv);
        assert_eq!(WcOpcode::from(5), WcOpcode::Other(5));
    }
}
