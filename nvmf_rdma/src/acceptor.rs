//! CONNECT negotiation and the CM event loop.

use std::io;
use std::rc::Rc;

use log::{debug, error, trace};

use rdmacm::{CmEvent, CmEventType, CmId};

use crate::capsule::{
    AcceptPrivateData, RejectPrivateData, RequestPrivateData, SC_INTERNAL_DEVICE_ERROR,
};
use crate::conn::RdmaConn;
use crate::error::{Error, Result};
use crate::request::NvmfBackend;
use crate::transport::RdmaTransport;
use crate::verbs::{self, VerbsQueuePair};

/// Negotiate the per-connection queue depth and RDMA READ/WRITE depth:
/// the minimum of the target default, the local device limits, the remote
/// initiator depth, and the host-requested queue sizes (when the host sent
/// private data of at least the documented length).
pub(crate) fn negotiate_depths(
    target_max: u16,
    max_qp_wr: i32,
    max_qp_rd_atom: i32,
    initiator_depth: u8,
    host: Option<RequestPrivateData>,
) -> (u16, u16) {
    let clamp = |v: i32| v.clamp(0, u16::MAX as i32) as u16;

    let mut max_queue_depth = target_max;
    let mut max_rw_depth = target_max;

    max_queue_depth = max_queue_depth.min(clamp(max_qp_wr));
    max_rw_depth = max_rw_depth.min(clamp(max_qp_rd_atom));
    max_rw_depth = max_rw_depth.min(initiator_depth as u16);

    if let Some(host) = host {
        debug!(
            "host receive queue size {}, host send queue size {}",
            host.hrqsize, host.hsqsize
        );
        max_queue_depth = max_queue_depth.min(host.hrqsize).min(host.hsqsize);
    }

    (max_queue_depth, max_rw_depth)
}

fn reject_with_status(id: &CmId, sc: u8) {
    let data = RejectPrivateData::with_sc(sc).to_bytes();
    if let Err(e) = id.reject(&data) {
        error!("rdma_reject failed: {}", e);
    }
}

impl RdmaTransport {
    /// Poll the acceptor once: drive pending (pre-CONNECT) connections and
    /// drain the CM event channel. Connections whose CONNECT was processed
    /// are returned to the caller, which owns them from then on.
    pub fn acceptor_poll(&mut self, backend: &mut dyn NvmfBackend) -> Vec<RdmaConn> {
        let mut established = Vec::new();

        if self.chan.is_none() {
            return established;
        }

        // The only capsule a pending connection should ever process is the
        // CONNECT request.
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i].poll(backend) {
                Err(e) => {
                    error!("pending connection failed: {}", e);
                    let conn = self.pending.remove(i);
                    drop(conn);
                }
                Ok(0) => i += 1,
                Ok(_) => {
                    established.push(self.pending.remove(i));
                }
            }
        }

        loop {
            let event = match self.chan.as_ref().map(|chan| chan.poll_event()) {
                Some(Ok(Some(event))) => event,
                Some(Ok(None)) | None => break,
                Some(Err(e)) => {
                    error!("acceptor event error: {}", e);
                    break;
                }
            };

            trace!("acceptor event: {:?}", event.event_type());
            match event.event_type() {
                CmEventType::ConnectRequest => {
                    if let Err(e) = self.handle_connect(&event) {
                        error!("unable to process connect event: {}", e);
                    }
                }
                CmEventType::Established => {}
                CmEventType::AddrChange
                | CmEventType::Disconnected
                | CmEventType::DeviceRemoval
                | CmEventType::TimewaitExit => {
                    if let Err(e) = self.handle_disconnect(event) {
                        error!("unable to process disconnect event: {}", e);
                    }
                }
                other => {
                    error!("unexpected acceptor event: {:?}", other);
                }
            }
            // Events not consumed above are acknowledged when dropped.
        }

        established
    }

    /// CONNECT_REQUEST: negotiate depths, build the connection, and accept
    /// with `{recfmt = 0, crqsize}` private data. On failure the initiator
    /// is rejected with an NVMe status whenever the id is still usable.
    fn handle_connect(&mut self, event: &CmEvent) -> Result<()> {
        let raw_id = event.id_raw();
        let params = event.conn_params();
        let host = event.private_data().and_then(RequestPrivateData::from_bytes);

        let mut cm_id = unsafe { CmId::from_raw(raw_id) }.map_err(|e| {
            error!("connect request: missing cm_id");
            Error::Io(e)
        })?;

        if !cm_id.has_verbs() {
            error!("connect request: missing cm_id ibv_context");
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cm_id without verbs context",
            )));
        }

        let attr = match cm_id.query_device() {
            Ok(attr) => attr,
            Err(e) => {
                error!("failed to query RDMA device attributes: {}", e);
                reject_with_status(&cm_id, SC_INTERNAL_DEVICE_ERROR);
                return Err(Error::Io(e));
            }
        };

        debug!(
            "local NIC max send/recv queue depth {}, max read/write depth {}; \
             host max incoming RDMA R/W {}, max outgoing RDMA R/W {}",
            attr.max_qp_wr(),
            attr.max_qp_rd_atom(),
            params.initiator_depth,
            params.responder_resources
        );

        let (max_queue_depth, max_rw_depth) = negotiate_depths(
            self.config.max_queue_depth,
            attr.max_qp_wr(),
            attr.max_qp_rd_atom(),
            params.initiator_depth,
            host,
        );
        debug!(
            "final negotiated queue depth {}, R/W depth {}",
            max_queue_depth, max_rw_depth
        );

        if let Err(e) = verbs::setup_qp(&mut cm_id, max_queue_depth) {
            error!("rdma_create_qp failed: {}", e);
            reject_with_status(&cm_id, SC_INTERNAL_DEVICE_ERROR);
            return Err(Error::Io(e));
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        cm_id.set_context(conn_id);

        let cm_id = Rc::new(cm_id);
        let conn = match RdmaConn::new(
            conn_id,
            Box::new(VerbsQueuePair::new(cm_id.clone())),
            max_queue_depth,
            max_rw_depth,
            self.config.in_capsule_data_size,
            self.config.max_io_size,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                error!("error on nvmf connection creation: {}", e);
                reject_with_status(&cm_id, SC_INTERNAL_DEVICE_ERROR);
                return Err(e);
            }
        };

        let accept_data = AcceptPrivateData {
            recfmt: 0,
            crqsize: max_queue_depth,
        }
        .to_bytes();
        let mut accept_params = params;
        // The target performs no host-side RDMA reads.
        accept_params.responder_resources = 0;
        accept_params.initiator_depth = max_rw_depth as u8;

        if let Err(e) = cm_id.accept(&accept_params, &accept_data) {
            error!("error on rdma_accept: {}", e);
            return Err(Error::Io(e));
        }
        trace!("sent back the accept for connection {}", conn_id);

        // Park the connection until its CONNECT capsule arrives.
        self.pending.push(conn);

        Ok(())
    }

    /// Disconnect-class event: acknowledge it first, then route by the id's
    /// context cookie.
    fn handle_disconnect(&mut self, event: CmEvent) -> Result<()> {
        if event.id_raw().is_null() {
            error!("disconnect request: missing cm_id");
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "disconnect without cm_id",
            )));
        }

        let conn_id = event.id_context();
        if conn_id == 0 {
            error!("disconnect request: no active connection");
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "disconnect for unknown connection",
            )));
        }

        // Acknowledge before any teardown invalidates the id.
        if let Err(e) = event.ack() {
            error!("failed to ack disconnect event: {}", e);
        }

        self.route_disconnect(conn_id)
    }

    /// A connection still waiting for CONNECT is destroyed on the spot;
    /// a session-bound one is handed to the executor owning the session.
    pub(crate) fn route_disconnect(&mut self, conn_id: u64) -> Result<()> {
        if let Some(pos) = self.pending.iter().position(|conn| conn.id() == conn_id) {
            debug!(
                "connection {} disconnected before CONNECT, destroying",
                conn_id
            );
            let conn = self.pending.remove(pos);
            drop(conn);
            return Ok(());
        }

        match self.executors.get(&conn_id) {
            Some(&executor) => {
                self.dispatcher.dispatch(executor, conn_id);
                Ok(())
            }
            None => {
                error!("disconnect request: no active connection {}", conn_id);
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    "disconnect for unknown connection",
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_takes_the_minimum_of_all_limits() {
        // Target default wins when everything else is larger.
        assert_eq!(negotiate_depths(128, 4096, 256, 255, None), (128, 128));

        // Device WR limit caps the queue depth.
        assert_eq!(negotiate_depths(128, 64, 256, 255, None), (64, 128));

        // Device RD-atom limit and remote initiator depth cap the RW depth.
        assert_eq!(negotiate_depths(128, 4096, 16, 255, None), (128, 16));
        assert_eq!(negotiate_depths(128, 4096, 256, 4, None), (128, 4));

        // Host-requested queue sizes cap the queue depth.
        let host = RequestPrivateData {
            recfmt: 0,
            qid: 1,
            hrqsize: 32,
            hsqsize: 31,
        };
        assert_eq!(negotiate_depths(128, 4096, 256, 255, Some(host)), (31, 128));
    }

    #[test]
    fn negotiation_clamps_nonsense_device_limits() {
        assert_eq!(negotiate_depths(128, -1, -1, 255, None), (0, 0));
        assert_eq!(negotiate_depths(128, i32::MAX, i32::MAX, 255, None), (128, 128));
    }
}
