//! The RDMA transport context and the transport operation set.
//!
//! The context bundles what the original kept as process globals: the
//! negotiated defaults, the CM event channel and listener, and the
//! connections that have not yet seen their CONNECT capsule. A process
//! normally creates exactly one.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::rc::Rc;

use log::{debug, info, trace};

use rdmacm::{CmId, DeviceList, EventChannel};

use crate::config::RdmaTransportConfig;
use crate::conn::RdmaConn;
use crate::discovery::{self, DiscoveryLogEntry, ListenAddr};
use crate::error::Result;
use crate::pool::RdmaSession;
use crate::request::NvmfBackend;

/// Listen backlog for the acceptor.
const LISTEN_BACKLOG: i32 = 10;

/// Cross-executor hand-off for disconnects. A disconnect for a
/// session-bound connection must run on the executor owning the session;
/// this is the opaque primitive that gets it there.
pub trait DisconnectDispatcher {
    fn dispatch(&self, executor: u32, conn_id: u64);
}

/// The RDMA transport.
pub struct RdmaTransport {
    pub(crate) config: RdmaTransportConfig,
    pub(crate) num_devices: u32,
    pub(crate) chan: Option<EventChannel>,
    pub(crate) listen_id: Option<CmId>,
    /// Connections that have not yet processed their CONNECT capsule.
    pub(crate) pending: Vec<RdmaConn>,
    /// Executor owning each session-bound connection, for disconnect
    /// routing.
    pub(crate) executors: HashMap<u64, u32>,
    pub(crate) dispatcher: Box<dyn DisconnectDispatcher>,
    pub(crate) next_conn_id: u64,
}

impl RdmaTransport {
    /// Initialize the transport: enumerate the RDMA devices, log their
    /// capabilities, and record the defaults. With zero usable devices the
    /// acceptor stays inert.
    pub fn new(config: RdmaTransportConfig, dispatcher: Box<dyn DisconnectDispatcher>) -> Self {
        info!("*** RDMA transport init ***");
        let num_devices = scan_devices();
        Self {
            config,
            num_devices,
            chan: None,
            listen_id: None,
            pending: Vec::new(),
            executors: HashMap::new(),
            dispatcher,
            next_conn_id: 1,
        }
    }

    #[cfg(test)]
    pub(crate) fn without_devices(
        config: RdmaTransportConfig,
        dispatcher: Box<dyn DisconnectDispatcher>,
    ) -> Self {
        Self {
            config,
            num_devices: 0,
            chan: None,
            listen_id: None,
            pending: Vec::new(),
            executors: HashMap::new(),
            dispatcher,
            next_conn_id: 1,
        }
    }

    /// Count of usable RDMA devices found at init.
    pub fn num_devices(&self) -> u32 {
        self.num_devices
    }

    pub fn config(&self) -> &RdmaTransportConfig {
        &self.config
    }

    /// Create the non-blocking CM event channel, bind the listener to the
    /// configured address, and start listening.
    pub fn acceptor_init(&mut self) -> Result<()> {
        if self.num_devices == 0 {
            return Ok(());
        }

        let chan = EventChannel::new()?;
        chan.set_nonblocking()?;

        let listen_id = CmId::create(&chan)?;
        listen_id.bind_addr(SocketAddrV4::new(
            self.config.listen_addr,
            self.config.listen_port,
        ))?;
        listen_id.listen(LISTEN_BACKLOG)?;

        info!(
            "*** NVMf target listening on {}:{} ***",
            self.config.listen_addr, self.config.listen_port
        );

        self.chan = Some(chan);
        self.listen_id = Some(listen_id);
        Ok(())
    }

    /// Tear the acceptor down: the listener id first, then the channel.
    pub fn acceptor_fini(&mut self) {
        self.listen_id = None;
        self.chan = None;
    }

    /// First connection of a session: build the session pool registered on
    /// this connection's device and bind the connection to it.
    pub fn session_init(
        &mut self,
        conn: &mut RdmaConn,
        executor: u32,
    ) -> Result<Rc<RefCell<RdmaSession>>> {
        let session = RdmaSession::new(
            conn.qp(),
            self.config.max_queue_depth,
            self.config.max_io_size,
            executor,
        )?;
        let session = Rc::new(RefCell::new(session));
        conn.bind_session(session.clone());
        self.executors.insert(conn.id(), executor);
        Ok(session)
    }

    /// A later connection joins an existing session. The connection is
    /// assumed to live on the same device the pool was registered against.
    pub fn session_join(&mut self, conn: &mut RdmaConn, session: &Rc<RefCell<RdmaSession>>) {
        let executor = session.borrow().executor();
        conn.bind_session(session.clone());
        self.executors.insert(conn.id(), executor);
    }

    /// Tear down a session. All of the session's connections must be
    /// finished first; the pool and its registration unwind here.
    pub fn session_fini(&mut self, session: Rc<RefCell<RdmaSession>>) {
        drop(session);
    }

    /// Destroy a connection and forget its disconnect route.
    pub fn conn_fini(&mut self, mut conn: RdmaConn) {
        trace!("closing connection {}", conn.id());
        self.executors.remove(&conn.id());
        conn.unbind_session();
        drop(conn);
    }

    /// Write the discovery log entry for an RDMA listener.
    pub fn listen_addr_discover(&self, addr: &ListenAddr, entry: &mut DiscoveryLogEntry) {
        discovery::fill_rdma_entry(addr, entry);
    }
}

fn scan_devices() -> u32 {
    let devices = match DeviceList::list() {
        Ok(devices) => devices,
        Err(_) => {
            info!("no RDMA verbs devices found");
            return 0;
        }
    };

    debug!("{} RDMA verbs device(s) discovered", devices.len());

    let mut found = 0;
    for device in devices.iter() {
        let name = device.name();
        let ctx = match device.open() {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("no rdma context returned for device {}: {}", name, e);
                continue;
            }
        };
        let attr = match ctx.query_device() {
            Ok(attr) => attr,
            Err(e) => {
                log::error!("failed to query device {}: {}", name, e);
                continue;
            }
        };

        debug!(
            "device {}: max MR size {:#x}, page size cap {:#x}, \
             max QP {:#x}, max QP WR {:#x}, max SGE {:#x}, \
             max CQ {:#x}, max CQE {:#x}, max MR {:#x}, max PD {:#x}, \
             max QP RD atom {:#x}, max QP init RD atom {:#x}, \
             max res RD atom {:#x}, max SRQ {:#x}, max SRQ WR {:#x}, \
             max SRQ SGE {:#x}, max pkeys {:#x}, phys port cnt {}",
            name,
            attr.max_mr_size(),
            attr.page_size_cap(),
            attr.max_qp(),
            attr.max_qp_wr(),
            attr.max_sge(),
            attr.max_cq(),
            attr.max_cqe(),
            attr.max_mr(),
            attr.max_pd(),
            attr.max_qp_rd_atom(),
            attr.max_qp_init_rd_atom(),
            attr.max_res_rd_atom(),
            attr.max_srq(),
            attr.max_srq_wr(),
            attr.max_srq_sge(),
            attr.max_pkeys(),
            attr.phys_port_cnt()
        );

        found += 1;
    }

    debug!("{} fabric intf(s) active", found);
    found
}

/// The transport operation set: one tagged variant of the generic fabric
/// transport, one dispatch per operation.
pub trait FabricTransport {
    type Conn;
    type Session;

    /// Transport teardown. Resource cleanup happens when the transport is
    /// dropped; this hook exists for transports that need an explicit step.
    fn fini(&mut self) {}

    fn acceptor_init(&mut self) -> Result<()>;
    fn acceptor_poll(&mut self, backend: &mut dyn NvmfBackend) -> Vec<Self::Conn>;
    fn acceptor_fini(&mut self);

    fn session_init(&mut self, conn: &mut Self::Conn, executor: u32) -> Result<Self::Session>;
    fn session_fini(&mut self, session: Self::Session);

    fn req_complete(&mut self, conn: &mut Self::Conn, slot: usize) -> Result<()>;
    fn req_release(&mut self, conn: &mut Self::Conn, slot: usize) -> Result<()>;

    fn conn_poll(&mut self, conn: &mut Self::Conn, backend: &mut dyn NvmfBackend)
        -> Result<usize>;
    fn conn_fini(&mut self, conn: Self::Conn);

    fn listen_addr_discover(&self, addr: &ListenAddr, entry: &mut DiscoveryLogEntry);
}

impl FabricTransport for RdmaTransport {
    type Conn = RdmaConn;
    type Session = Rc<RefCell<RdmaSession>>;

    fn acceptor_init(&mut self) -> Result<()> {
        RdmaTransport::acceptor_init(self)
    }

    fn acceptor_poll(&mut self, backend: &mut dyn NvmfBackend) -> Vec<RdmaConn> {
        RdmaTransport::acceptor_poll(self, backend)
    }

    fn acceptor_fini(&mut self) {
        RdmaTransport::acceptor_fini(self)
    }

    fn session_init(
        &mut self,
        conn: &mut RdmaConn,
        executor: u32,
    ) -> Result<Rc<RefCell<RdmaSession>>> {
        RdmaTransport::session_init(self, conn, executor)
    }

    fn session_fini(&mut self, session: Rc<RefCell<RdmaSession>>) {
        RdmaTransport::session_fini(self, session)
    }

    fn req_complete(&mut self, conn: &mut RdmaConn, slot: usize) -> Result<()> {
        conn.req_complete(slot)
    }

    fn req_release(&mut self, conn: &mut RdmaConn, slot: usize) -> Result<()> {
        conn.req_release(slot)
    }

    fn conn_poll(&mut self, conn: &mut RdmaConn, backend: &mut dyn NvmfBackend) -> Result<usize> {
        conn.poll(backend)
    }

    fn conn_fini(&mut self, conn: RdmaConn) {
        RdmaTransport::conn_fini(self, conn)
    }

    fn listen_addr_discover(&self, addr: &ListenAddr, entry: &mut DiscoveryLogEntry) {
        RdmaTransport::listen_addr_discover(self, addr, entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockQp, RecordingDispatcher};

    fn mock_conn(id: u64) -> RdmaConn {
        RdmaConn::new(id, Box::new(MockQp::new()), 4, 2, 4096, 65536).unwrap()
    }

    #[test]
    fn disconnect_before_connect_destroys_pending_without_dispatch() {
        let dispatcher = RecordingDispatcher::new();
        let mut transport = RdmaTransport::without_devices(
            RdmaTransportConfig::default(),
            Box::new(dispatcher.clone()),
        );

        transport.pending.push(mock_conn(42));
        transport.route_disconnect(42).unwrap();

        assert!(transport.pending.is_empty());
        assert!(dispatcher.dispatched.borrow().is_empty());
    }

    #[test]
    fn disconnect_for_bound_connection_dispatches_to_owner() {
        let dispatcher = RecordingDispatcher::new();
        let mut transport = RdmaTransport::without_devices(
            RdmaTransportConfig::default(),
            Box::new(dispatcher.clone()),
        );

        transport.executors.insert(9, 3);
        transport.route_disconnect(9).unwrap();

        assert_eq!(&*dispatcher.dispatched.borrow(), &[(3, 9)]);
    }

    #[test]
    fn disconnect_for_unknown_connection_is_an_error() {
        let dispatcher = RecordingDispatcher::new();
        let mut transport = RdmaTransport::without_devices(
            RdmaTransportConfig::default(),
            Box::new(dispatcher.clone()),
        );

        assert!(transport.route_disconnect(1).is_err());
    }

    #[test]
    fn session_init_binds_conn_and_routes_disconnects() {
        let dispatcher = RecordingDispatcher::new();
        let mut transport = RdmaTransport::without_devices(
            RdmaTransportConfig::default().with_max_queue_depth(4),
            Box::new(dispatcher.clone()),
        );

        let mut conn = mock_conn(5);
        let session = transport.session_init(&mut conn, 2).unwrap();
        assert_eq!(session.borrow().executor(), 2);
        assert!(conn.session().is_some());

        transport.route_disconnect(5).unwrap();
        assert_eq!(&*dispatcher.dispatched.borrow(), &[(2, 5)]);

        transport.conn_fini(conn);
        assert!(transport.route_disconnect(5).is_err());
        transport.session_fini(session);
    }
}
