//! Request pipeline tests, driven hardware-free through the mock queue
//! pair: the test plays the wire by injecting work completions and plays
//! the upper layer by completing executed requests.

use std::cell::RefCell;
use std::rc::Rc;

use nvmf_rdma::capsule::{
    NvmeCmd, CMD_CAPSULE_SIZE, SC_DATA_SGL_LENGTH_INVALID, SC_INVALID_SGL_OFFSET,
    SC_SGL_DESCRIPTOR_TYPE_INVALID, SGL_SUBTYPE_ADDRESS,
};
use nvmf_rdma::test_utils::{MockBackend, MockQp};
use nvmf_rdma::{DataTransfer, RdmaConn, RdmaSession, ReqBuf, ReqState};

const IN_CAPSULE_SIZE: u32 = 4096;
const MAX_IO_SIZE: u32 = 65536;

const OPC_FLUSH: u8 = 0x00;
const OPC_WRITE: u8 = 0x01;
const OPC_READ: u8 = 0x02;

fn new_conn(depth: u16, rw_depth: u16) -> (RdmaConn, MockQp) {
    let qp = MockQp::new();
    let conn = RdmaConn::new(
        1,
        Box::new(qp.clone()),
        depth,
        rw_depth,
        IN_CAPSULE_SIZE,
        MAX_IO_SIZE,
    )
    .unwrap();
    (conn, qp)
}

fn new_conn_with_session(
    depth: u16,
    rw_depth: u16,
    pool_chunks: u16,
) -> (RdmaConn, MockQp, Rc<RefCell<RdmaSession>>) {
    let (mut conn, qp) = new_conn(depth, rw_depth);
    let session = Rc::new(RefCell::new(
        RdmaSession::new(&qp, pool_chunks, MAX_IO_SIZE, 0).unwrap(),
    ));
    conn.bind_session(session.clone());
    (conn, qp, session)
}

fn in_capsule_cmd(opc: u8, cid: u16, offset: u64, length: u32) -> NvmeCmd {
    let mut cmd = NvmeCmd::zeroed();
    cmd.opc = opc;
    cmd.cid = cid;
    cmd.set_sgl1_in_capsule(offset, length);
    cmd
}

fn keyed_cmd(opc: u8, cid: u16, address: u64, length: u32, key: u32) -> NvmeCmd {
    let mut cmd = NvmeCmd::zeroed();
    cmd.opc = opc;
    cmd.cid = cid;
    cmd.set_sgl1_keyed(address, length, key, SGL_SUBTYPE_ADDRESS);
    cmd
}

/// Write a capsule into a slot and complete its RECV, as the wire would.
fn deliver(conn: &mut RdmaConn, qp: &MockQp, slot: usize, cmd: NvmeCmd, data_len: u32) {
    *conn.cmd_mut(slot) = cmd;
    qp.complete_recv(slot as u64, CMD_CAPSULE_SIZE as u32 + data_len);
}

/// Number of slots somewhere in the pipeline (anything but posted-for-recv).
fn in_flight_slots(conn: &RdmaConn) -> u16 {
    (0..conn.max_queue_depth() as usize)
        .filter(|&slot| conn.req(slot).state() != ReqState::Posted)
        .count() as u16
}

fn pool_chunks_held(conn: &RdmaConn) -> usize {
    (0..conn.max_queue_depth() as usize)
        .filter(|&slot| matches!(conn.req(slot).buf(), ReqBuf::Pool { .. }))
        .count()
}

// ---------------------------------------------------------------------------
// Scenario: small write carried entirely in-capsule
// ---------------------------------------------------------------------------

#[test]
fn small_write_in_capsule() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    deliver(&mut conn, &qp, 0, in_capsule_cmd(OPC_WRITE, 7, 0, 512), 512);

    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 1);
    assert_eq!(conn.cur_queue_depth(), 1);
    assert_eq!(conn.req(0).state(), ReqState::Executing);

    // The data was already in the capsule: no RDMA READ or WRITE.
    assert_eq!(qp.read_count(), 0);
    assert_eq!(qp.write_count(), 0);

    let exec = &backend.executed[0];
    assert_eq!(exec.slot, 0);
    assert_eq!(exec.xfer, DataTransfer::HostToController);
    assert_eq!(exec.length, 512);
    assert!(exec.had_data);

    // Backend completes; the completion SEND goes out and the slot's RECV
    // is re-posted first.
    conn.req_complete(0).unwrap();
    assert_eq!(conn.req(0).state(), ReqState::SendPosted);
    assert_eq!(qp.send_count(), 1);
    assert_eq!(qp.recv_count(), 5);
    assert_eq!(conn.rsp(0).sqhd, 1);
    assert_eq!(conn.rsp(0).cid, 7);

    qp.complete_send(0);
    assert_eq!(conn.poll(&mut backend).unwrap(), 0);
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.req(0).state(), ReqState::Posted);
}

// ---------------------------------------------------------------------------
// Scenario: large write staged through the session pool
// ---------------------------------------------------------------------------

#[test]
fn large_write_uses_session_pool() {
    let (mut conn, qp, session) = new_conn_with_session(4, 2, 4);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_WRITE, 3, 0x7000_0000, MAX_IO_SIZE, 0x1234),
        0,
    );

    // Prep consumes a chunk and posts the RDMA READ; the backend is not
    // called until the host data lands.
    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 0);
    assert_eq!(conn.req(0).state(), ReqState::RwPosted);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(session.borrow().pool().available(), 3);

    let read = qp.last_read().unwrap();
    assert_eq!(read.wr_id, 0);
    assert_eq!(read.remote_addr, 0x7000_0000);
    assert_eq!(read.rkey, 0x1234);
    assert_eq!(read.sge.length, MAX_IO_SIZE);
    assert_eq!(read.sge.lkey, session.borrow().pool().lkey());

    qp.complete_read(0);
    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 1);
    assert_eq!(conn.cur_rdma_rw_depth(), 0);
    assert_eq!(backend.executed[0].length, MAX_IO_SIZE);

    // Completion returns the chunk before the SEND goes out.
    conn.req_complete(0).unwrap();
    assert_eq!(session.borrow().pool().available(), 4);
    assert_eq!(qp.send_count(), 1);

    qp.complete_send(0);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: read (controller-to-host) writes back after execution
// ---------------------------------------------------------------------------

#[test]
fn read_transfers_data_after_execution() {
    let (mut conn, qp, session) = new_conn_with_session(4, 2, 4);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_READ, 9, 0x5000_0000, MAX_IO_SIZE, 0xabcd),
        0,
    );

    // Controller-to-host data moves only after the backend fills it.
    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 1);
    assert_eq!(qp.write_count(), 0);
    assert_eq!(session.borrow().pool().available(), 3);

    conn.req_complete(0).unwrap();
    assert_eq!(conn.req(0).state(), ReqState::RwPosted);
    let write = qp.last_write().unwrap();
    assert_eq!(write.remote_addr, 0x5000_0000);
    assert_eq!(write.rkey, 0xabcd);

    // WRITE completion sends the response and frees the chunk.
    qp.complete_write(0);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.req(0).state(), ReqState::SendPosted);
    assert_eq!(session.borrow().pool().available(), 4);
    assert_eq!(qp.send_count(), 1);

    qp.complete_send(0);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: RDMA R/W credit starvation
// ---------------------------------------------------------------------------

#[test]
fn rw_credit_starvation_queues_second_read() {
    let (mut conn, qp, _session) = new_conn_with_session(4, 1, 4);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_WRITE, 1, 0x1000, MAX_IO_SIZE, 0x11),
        0,
    );
    deliver(
        &mut conn,
        &qp,
        1,
        keyed_cmd(OPC_WRITE, 2, 0x2000, MAX_IO_SIZE, 0x22),
        0,
    );

    conn.poll(&mut backend).unwrap();

    // Exactly one READ in flight; the second slot waits for the credit.
    assert_eq!(qp.read_count(), 1);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(conn.pending_rdma_rw_len(), 1);
    assert_eq!(conn.pending_rdma_rw_head(), Some(1));
    assert_eq!(conn.req(1).state(), ReqState::WaitRw);

    // The first READ completing releases the credit; the queued READ posts
    // in the same poll.
    qp.complete_read(0);
    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 1);
    assert_eq!(qp.read_count(), 2);
    assert_eq!(qp.last_read().unwrap().wr_id, 1);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(conn.pending_rdma_rw_len(), 0);
}

#[test]
fn queued_rw_posts_before_new_recv_is_processed() {
    let (mut conn, qp, _session) = new_conn_with_session(4, 1, 4);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_WRITE, 1, 0x1000, MAX_IO_SIZE, 0x11),
        0,
    );
    deliver(
        &mut conn,
        &qp,
        1,
        keyed_cmd(OPC_WRITE, 2, 0x2000, MAX_IO_SIZE, 0x22),
        0,
    );
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.pending_rdma_rw_len(), 1);

    // One credit release and one fresh capsule arrive before the next poll.
    qp.complete_read(0);
    deliver(
        &mut conn,
        &qp,
        2,
        keyed_cmd(OPC_WRITE, 3, 0x3000, MAX_IO_SIZE, 0x33),
        0,
    );

    conn.poll(&mut backend).unwrap();

    // The queued slot took the credit; the new arrival went to the queue.
    assert_eq!(qp.read_count(), 2);
    assert_eq!(qp.last_read().unwrap().wr_id, 1);
    assert_eq!(conn.req(2).state(), ReqState::WaitRw);
    assert_eq!(conn.pending_rdma_rw_head(), Some(2));
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
}

// ---------------------------------------------------------------------------
// Scenario: session pool exhaustion
// ---------------------------------------------------------------------------

#[test]
fn buffer_starvation_parks_request_until_chunk_returns() {
    // A single-chunk pool so the second large request starves.
    let (mut conn, qp, session) = new_conn_with_session(4, 2, 1);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_READ, 1, 0x1000, MAX_IO_SIZE, 0x11),
        0,
    );
    deliver(
        &mut conn,
        &qp,
        1,
        keyed_cmd(OPC_WRITE, 2, 0x2000, MAX_IO_SIZE, 0x22),
        0,
    );

    let count = conn.poll(&mut backend).unwrap();
    // The read took the only chunk and went to the backend; the write is
    // parked with no buffer and makes no progress.
    assert_eq!(count, 1);
    assert_eq!(session.borrow().pool().available(), 0);
    assert_eq!(conn.req(1).state(), ReqState::WaitBuf);
    assert_eq!(conn.pending_data_buf_len(), 1);
    assert_eq!(qp.read_count(), 0);

    // Nothing changes while the chunk is held.
    assert_eq!(conn.poll(&mut backend).unwrap(), 0);
    assert_eq!(conn.req(1).state(), ReqState::WaitBuf);

    // The read completes: WRITE back, then its completion returns the
    // chunk, and the parked host-to-controller request routes through the
    // RW queue to an RDMA READ.
    conn.req_complete(0).unwrap();
    qp.complete_write(0);
    conn.poll(&mut backend).unwrap();

    assert_eq!(conn.pending_data_buf_len(), 0);
    assert_eq!(qp.read_count(), 1);
    assert_eq!(qp.last_read().unwrap().wr_id, 1);
    assert_eq!(conn.req(1).state(), ReqState::RwPosted);
    // The chunk moved straight to the parked request.
    assert_eq!(session.borrow().pool().available(), 0);
    assert_eq!(pool_chunks_held(&conn), 1);
}

#[test]
fn starved_controller_to_host_request_goes_to_backend_on_chunk() {
    let (mut conn, qp, session) = new_conn_with_session(4, 2, 1);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_READ, 1, 0x1000, MAX_IO_SIZE, 0x11),
        0,
    );
    deliver(
        &mut conn,
        &qp,
        1,
        keyed_cmd(OPC_READ, 2, 0x2000, MAX_IO_SIZE, 0x22),
        0,
    );
    assert_eq!(conn.poll(&mut backend).unwrap(), 1);
    assert_eq!(conn.req(1).state(), ReqState::WaitBuf);

    conn.req_complete(0).unwrap();
    qp.complete_write(0);
    // Controller-to-host: once a chunk frees up the request goes straight
    // to the backend, no RDMA READ first.
    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 1);
    assert_eq!(backend.executed[1].slot, 1);
    assert_eq!(qp.read_count(), 0);
    assert_eq!(session.borrow().pool().available(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: malformed SGLs answered in the completion capsule
// ---------------------------------------------------------------------------

#[test]
fn reserved_sgl_type_fails_the_command_not_the_connection() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    let mut cmd = NvmeCmd::zeroed();
    cmd.opc = OPC_WRITE;
    cmd.cid = 5;
    cmd.dptr[15] = 0x2 << 4; // segment descriptor: not supported
    deliver(&mut conn, &qp, 0, cmd, 0);

    let count = conn.poll(&mut backend).unwrap();
    assert_eq!(count, 0);
    assert!(backend.executed.is_empty());

    // No data movement; the error went out as a completion and the RECV
    // was re-posted.
    assert_eq!(qp.read_count(), 0);
    assert_eq!(qp.write_count(), 0);
    assert_eq!(qp.send_count(), 1);
    assert_eq!(qp.recv_count(), 5);
    assert_eq!(conn.rsp(0).sc(), SC_SGL_DESCRIPTOR_TYPE_INVALID);
    assert_eq!(conn.req(0).state(), ReqState::SendPosted);

    qp.complete_send(0);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
}

#[test]
fn oversized_keyed_sgl_is_rejected() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        keyed_cmd(OPC_WRITE, 1, 0x1000, MAX_IO_SIZE + 1, 0x11),
        0,
    );
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.rsp(0).sc(), SC_DATA_SGL_LENGTH_INVALID);
    assert_eq!(qp.send_count(), 1);
}

#[test]
fn in_capsule_offset_and_length_are_validated() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    deliver(
        &mut conn,
        &qp,
        0,
        in_capsule_cmd(OPC_WRITE, 1, IN_CAPSULE_SIZE as u64 + 1, 16),
        0,
    );
    deliver(
        &mut conn,
        &qp,
        1,
        in_capsule_cmd(OPC_WRITE, 2, 1024, IN_CAPSULE_SIZE - 1023),
        0,
    );
    conn.poll(&mut backend).unwrap();

    assert_eq!(conn.rsp(0).sc(), SC_INVALID_SGL_OFFSET);
    assert_eq!(conn.rsp(1).sc(), SC_DATA_SGL_LENGTH_INVALID);
    assert!(backend.executed.is_empty());
}

#[test]
fn zero_length_sgl_means_no_transfer() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    deliver(&mut conn, &qp, 0, keyed_cmd(OPC_WRITE, 1, 0x1000, 0, 0x11), 0);
    let count = conn.poll(&mut backend).unwrap();

    assert_eq!(count, 1);
    assert_eq!(backend.executed[0].xfer, DataTransfer::None);
    assert!(!backend.executed[0].had_data);
    assert_eq!(qp.read_count(), 0);
}

// ---------------------------------------------------------------------------
// Fatal wire conditions
// ---------------------------------------------------------------------------

#[test]
fn short_recv_is_fatal() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    qp.complete_recv(0, CMD_CAPSULE_SIZE as u32 - 1);
    assert!(conn.poll(&mut backend).is_err());
}

#[test]
fn failed_work_completion_is_fatal() {
    use nvmf_rdma::qp::{WcOpcode, WorkCompletion};

    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    qp.push_send_wc(WorkCompletion {
        wr_id: 0,
        status: 5,
        opcode: WcOpcode::Send,
        byte_len: 0,
    });
    assert!(conn.poll(&mut backend).is_err());
}

#[test]
fn unknown_opcode_on_send_cq_is_fatal() {
    use nvmf_rdma::qp::{WcOpcode, WorkCompletion};

    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    qp.push_send_wc(WorkCompletion {
        wr_id: 0,
        status: 0,
        opcode: WcOpcode::Other(9),
        byte_len: 0,
    });
    assert!(conn.poll(&mut backend).is_err());
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn depth_bounds_hold_under_load() {
    let (mut conn, qp, _session) = new_conn_with_session(4, 1, 4);
    let mut backend = MockBackend::new();

    for slot in 0..4u16 {
        deliver(
            &mut conn,
            &qp,
            slot as usize,
            keyed_cmd(OPC_WRITE, slot, 0x1000 * slot as u64, MAX_IO_SIZE, 0x11),
            0,
        );
    }
    conn.poll(&mut backend).unwrap();

    assert!(conn.cur_queue_depth() <= conn.max_queue_depth());
    assert!(conn.cur_rdma_rw_depth() <= conn.max_rw_depth());
    assert_eq!(conn.cur_queue_depth(), 4);
    assert_eq!(conn.cur_rdma_rw_depth(), 1);
    assert_eq!(conn.pending_rdma_rw_len(), 3);

    // Drain everything, checking the bounds at every step.
    for slot in 0..4u64 {
        qp.complete_read(slot);
        conn.poll(&mut backend).unwrap();
        assert!(conn.cur_rdma_rw_depth() <= conn.max_rw_depth());

        conn.req_complete(slot as usize).unwrap();
        qp.complete_send(slot);
        conn.poll(&mut backend).unwrap();
        assert!(conn.cur_queue_depth() <= conn.max_queue_depth());
    }

    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(conn.cur_rdma_rw_depth(), 0);
    assert_eq!(backend.executed.len(), 4);
}

#[test]
fn slot_accounting_matches_queue_depth() {
    let (mut conn, qp, _session) = new_conn_with_session(4, 2, 4);
    let mut backend = MockBackend::new();

    assert_eq!(in_flight_slots(&conn), 0);

    deliver(&mut conn, &qp, 0, in_capsule_cmd(OPC_WRITE, 1, 0, 64), 64);
    deliver(
        &mut conn,
        &qp,
        1,
        keyed_cmd(OPC_WRITE, 2, 0x2000, MAX_IO_SIZE, 0x22),
        0,
    );
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 2);
    assert_eq!(in_flight_slots(&conn), 2);

    qp.complete_read(1);
    conn.poll(&mut backend).unwrap();
    conn.req_complete(0).unwrap();
    conn.req_complete(1).unwrap();
    assert_eq!(in_flight_slots(&conn), 2);

    qp.complete_send(0);
    qp.complete_send(1);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(in_flight_slots(&conn), 0);
}

#[test]
fn pool_chunks_are_conserved() {
    let (mut conn, qp, session) = new_conn_with_session(4, 2, 4);
    let mut backend = MockBackend::new();

    let check = |conn: &RdmaConn| {
        assert_eq!(
            session.borrow().pool().available() + pool_chunks_held(conn),
            4
        );
    };

    check(&conn);
    for slot in 0..3u16 {
        deliver(
            &mut conn,
            &qp,
            slot as usize,
            keyed_cmd(OPC_WRITE, slot, 0x1000, MAX_IO_SIZE, 0x11),
            0,
        );
    }
    conn.poll(&mut backend).unwrap();
    check(&conn);
    assert_eq!(session.borrow().pool().available(), 1);

    for slot in 0..3u64 {
        qp.complete_read(slot);
        conn.poll(&mut backend).unwrap();
        check(&conn);
        conn.req_complete(slot as usize).unwrap();
        check(&conn);
        qp.complete_send(slot);
        conn.poll(&mut backend).unwrap();
        check(&conn);
    }
    assert_eq!(session.borrow().pool().available(), 4);
}

#[test]
fn sq_head_wraps_and_is_stamped() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();
    assert_eq!(conn.sq_head_max(), 3);

    // Each completed request advances sq_head twice: once when the
    // completion is sent, once when the SEND is acknowledged.
    let mut expected = 0u16;
    for i in 0..4u64 {
        let mut cmd = NvmeCmd::zeroed();
        cmd.opc = OPC_FLUSH;
        cmd.cid = i as u16;
        deliver(&mut conn, &qp, 0, cmd, 0);
        conn.poll(&mut backend).unwrap();

        conn.req_complete(0).unwrap();
        expected = (expected + 1) % 4;
        assert_eq!(conn.rsp(0).sqhd, expected);
        assert_eq!(conn.sq_head(), expected);

        qp.complete_send(0);
        conn.poll(&mut backend).unwrap();
        expected = (expected + 1) % 4;
        assert_eq!(conn.sq_head(), expected);
    }

    // After sq_head_max + 1 completed requests the cursor is back at zero.
    assert_eq!(conn.sq_head(), 0);
}

#[test]
fn req_release_skips_the_completion_send() {
    let (mut conn, qp) = new_conn(4, 2);
    let mut backend = MockBackend::new();

    let mut cmd = NvmeCmd::zeroed();
    cmd.opc = OPC_FLUSH;
    deliver(&mut conn, &qp, 0, cmd, 0);
    conn.poll(&mut backend).unwrap();
    assert_eq!(conn.cur_queue_depth(), 1);

    conn.req_release(0).unwrap();
    assert_eq!(conn.cur_queue_depth(), 0);
    assert_eq!(qp.send_count(), 0);
    assert_eq!(conn.req(0).state(), ReqState::Posted);
}
