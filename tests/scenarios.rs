//! End-to-end scenarios against the loopback backend (spec.md §8): two
//! independently constructed `Endpoint`s, communicating through real
//! `mmap`'d files and FIFOs rather than mocks.

use vchan::{Endpoint, EndpointState, RuntimeDir};

fn runtime() -> RuntimeDir {
    RuntimeDir::new(tempfile::tempdir().unwrap().into_path())
}

#[test]
fn ping_pong() {
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 1, 4096, 4096, false).unwrap();
    let mut client = Endpoint::client_init(runtime, 0, 1).unwrap();

    let payload = b"0123456789\0";
    assert_eq!(client.packet_send(payload).unwrap(), payload.len());
    let mut buf = vec![0u8; payload.len()];
    assert_eq!(server.packet_recv(&mut buf).unwrap(), payload.len());
    assert_eq!(&buf, payload);

    assert_eq!(server.packet_send(&buf).unwrap(), payload.len());
    let mut buf2 = vec![0u8; payload.len()];
    assert_eq!(client.packet_recv(&mut buf2).unwrap(), payload.len());
    assert_eq!(&buf2, payload);

    server.close();
    client.close();
    assert!(!server.is_open());
    assert!(!client.is_open());
}

#[test]
fn order_negotiation_edge() {
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 3, 1024, 1024, false).unwrap();
    let mut client = Endpoint::client_init(runtime, 0, 3).unwrap();
    assert_eq!(client.packet_send(b"hi").unwrap(), 2);
    let mut buf = [0u8; 2];
    assert_eq!(server.packet_recv(&mut buf).unwrap(), 2);
    assert_eq!(&buf, b"hi");
}

#[test]
fn non_blocking_back_pressure() {
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 4, 1024, 1024, false).unwrap();
    let mut client = Endpoint::client_init(runtime, 0, 4).unwrap();
    client.set_blocking(false);
    server.set_blocking(false);

    let full = vec![7u8; 1024];
    assert_eq!(client.packet_send(&full).unwrap(), 1024);
    assert_eq!(client.packet_send(&[1u8]).unwrap(), 0);

    let mut sink = vec![0u8; 1024];
    assert_eq!(server.packet_recv(&mut sink).unwrap(), 1024);

    assert_eq!(client.packet_send(&[9u8]).unwrap(), 1);
}

#[test]
fn large_stream_with_wrap() {
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 5, 4096, 4096, false).unwrap();
    let mut client = Endpoint::client_init(runtime, 0, 5).unwrap();

    let total = 1_000_000usize;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let received = std::thread::scope(|scope| {
        let data_ref = &data;
        scope.spawn(move || {
            let mut written = 0;
            while written < data_ref.len() {
                let chunk = (data_ref.len() - written).min(4099);
                written += client
                    .stream_write(&data_ref[written..written + chunk])
                    .unwrap();
            }
        });

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            let mut buf = vec![0u8; 511];
            let n = server.stream_read(&mut buf).unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        received
    });

    assert_eq!(received, data);
}

#[test]
fn state_machine_transitions() {
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 8, 1024, 1024, false).unwrap();
    assert_eq!(server.state(), EndpointState::SrvWaitClient);

    let mut client = Endpoint::client_init(runtime, 0, 8).unwrap();
    assert_eq!(server.state(), EndpointState::Connected);
    assert_eq!(client.state(), EndpointState::Connected);

    assert_eq!(server.packet_send(b"still here").unwrap(), 10);
    server.close();

    // Server is gone but the client hasn't drained the buffered bytes yet.
    assert_eq!(client.state(), EndpointState::HalfClosed);
    let mut buf = [0u8; 10];
    assert_eq!(client.packet_recv(&mut buf).unwrap(), 10);
    assert_eq!(client.state(), EndpointState::Closed);
}

#[test]
fn peer_crash_is_observed() {
    // Both rings fit in-page at these sizes (spec.md §3.1 placement
    // policy), so the server's own backend allocates exactly one grant:
    // the shared page itself, ref 1. That makes its backing file's path
    // predictable without needing a non-public accessor.
    let runtime = runtime();
    let mut server = Endpoint::server_init(runtime.clone(), 0, 6, 1024, 1024, false).unwrap();
    let mut client = Endpoint::client_init(runtime.clone(), 0, 6).unwrap();

    // Server writes to the client before going away; the client has not
    // read it yet when the crash happens.
    assert_eq!(server.packet_send(b"still here").unwrap(), 10);

    // Simulate abnormal server teardown (spec.md §8 scenario 4): rip out
    // the shared page's backing file directly instead of calling
    // `close()`, so the only way either side can observe the crash is
    // through the unmap-notify watchdog (endpoint.rs's
    // `install_unmap_notify` hook), not through an orderly liveness-byte
    // flip. The existing mapping stays valid (removing a file doesn't
    // unmap it on a POSIX host), matching "forcibly unmapping" in spirit:
    // the peer vanishes without ever touching the liveness protocol.
    std::fs::remove_file(runtime.path().join("grants").join("1")).unwrap();

    client.wait().unwrap();
    assert!(!client.is_open());
    assert!(client.packet_send(b"x").is_err());

    let mut rest = vec![0u8; 32];
    let n = client.stream_read(&mut rest).unwrap();
    assert_eq!(n, 10);
    assert_eq!(&rest[..10], b"still here");
    let n2 = client.stream_read(&mut rest).unwrap();
    assert_eq!(n2, 0);
}
