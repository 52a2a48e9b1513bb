//! Transport-level integration tests.
//!
//! These exercise the real CM path and require an RDMA-capable device; on
//! machines without one the transport reports zero devices and the tests
//! skip the hardware parts.

use nvmf_rdma::test_utils::RecordingDispatcher;
use nvmf_rdma::{RdmaTransport, RdmaTransportConfig};

#[test]
fn transport_init_counts_devices() {
    let transport = RdmaTransport::new(
        RdmaTransportConfig::default(),
        Box::new(RecordingDispatcher::new()),
    );
    println!("RDMA devices found: {}", transport.num_devices());
}

#[test]
fn acceptor_is_inert_without_devices() {
    let mut transport = RdmaTransport::new(
        RdmaTransportConfig::default().with_listen_port(14420),
        Box::new(RecordingDispatcher::new()),
    );

    if transport.num_devices() > 0 {
        eprintln!("Skipping inert-acceptor check: RDMA devices present");
        return;
    }

    // No devices: init succeeds but starts nothing.
    transport.acceptor_init().expect("inert acceptor init");
    let mut backend = nvmf_rdma::test_utils::MockBackend::new();
    assert!(transport.acceptor_poll(&mut backend).is_empty());
    transport.acceptor_fini();
}

#[test]
fn acceptor_listens_when_devices_present() {
    let mut transport = RdmaTransport::new(
        RdmaTransportConfig::default().with_listen_port(14421),
        Box::new(RecordingDispatcher::new()),
    );

    if transport.num_devices() == 0 {
        eprintln!("Skipping test: no RDMA device available");
        return;
    }

    match RdmaTransport::acceptor_init(&mut transport) {
        Ok(()) => {
            let mut backend = nvmf_rdma::test_utils::MockBackend::new();
            assert!(transport.acceptor_poll(&mut backend).is_empty());
            transport.acceptor_fini();
        }
        Err(e) => {
            // Another listener may own the port on shared test machines.
            eprintln!("acceptor_init failed (tolerated in CI): {}", e);
        }
    }
}
