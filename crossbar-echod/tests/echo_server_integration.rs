//! End-to-end tests driving real TCP traffic through the connection factory
//! with the echo connection behind it.

use crossbar_core::{ConnectionFactory, FactoryConfig};
use crossbar_echod::EchoConnectionBuilder;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn test_config(sessionless_timeout_ms: u64) -> FactoryConfig {
    FactoryConfig {
        sessionless_cnxn_timeout: sessionless_timeout_ms,
        num_selector_threads: 2,
        num_worker_threads: 4,
        direct_buffer_bytes: 64 * 1024,
        shutdown_timeout: 2_000,
        max_client_cnxns: 60,
    }
}

fn start_server(max_client_cnxns: usize, config: FactoryConfig) -> (ConnectionFactory, SocketAddr) {
    let mut factory = ConnectionFactory::new(Arc::new(EchoConnectionBuilder));
    factory
        .configure_with("127.0.0.1:0".parse().unwrap(), max_client_cnxns, false, config)
        .expect("configure failed");
    factory.start().expect("start failed");
    let addr = factory.local_addr().unwrap();
    (factory, addr)
}

fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).unwrap();
    let mut got = vec![0u8; payload.len()];
    stream.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);
}

/// EOF (or a reset) must arrive on `stream` within `timeout`.
fn assert_closed_within(stream: &mut TcpStream, timeout: Duration) {
    stream.set_read_timeout(Some(timeout)).unwrap();
    let mut buf = [0u8; 16];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                panic!("connection still open after {timeout:?}")
            }
            Err(_) => return,
        }
    }
}

#[test]
fn test_echo_roundtrip() {
    let (mut factory, addr) = start_server(0, test_config(10_000));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    echo_roundtrip(&mut client, b"hello, crossbar");
    echo_roundtrip(&mut client, b"second message");

    factory.shutdown();
}

#[test]
fn test_echo_roundtrip_gathered_writes() {
    // direct_buffer_bytes == 0 exercises the write_vectored fallback
    let config = FactoryConfig { direct_buffer_bytes: 0, ..test_config(10_000) };
    let (mut factory, addr) = start_server(0, config);

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    echo_roundtrip(&mut client, b"gathered");

    factory.shutdown();
}

#[test]
fn test_echo_large_payload() {
    let (mut factory, addr) = start_server(0, test_config(10_000));

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let writer_payload = payload.clone();

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut writer = client.try_clone().unwrap();
    let writer_thread = thread::spawn(move || {
        writer.write_all(&writer_payload).unwrap();
    });

    let mut got = vec![0u8; payload.len()];
    client.read_exact(&mut got).unwrap();
    assert_eq!(got, payload);
    writer_thread.join().unwrap();

    factory.shutdown();
}

#[test]
fn test_per_peer_cap_enforcement() {
    let (mut factory, addr) = start_server(2, test_config(10_000));

    let mut first = TcpStream::connect(addr).unwrap();
    let mut second = TcpStream::connect(addr).unwrap();
    first.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(wait_for(|| factory.connections().len() == 2, Duration::from_secs(5)));

    // Third connection from the same IP: accepted at TCP level, then closed
    // with no bytes delivered
    let mut third = TcpStream::connect(addr).unwrap();
    assert_closed_within(&mut third, Duration::from_secs(1));
    assert_eq!(factory.connections().len(), 2);

    // The surviving pair is unaffected
    echo_roundtrip(&mut first, b"one");
    echo_roundtrip(&mut second, b"two");

    factory.shutdown();
}

#[test]
fn test_sessionless_connection_expires() {
    let (mut factory, addr) = start_server(0, test_config(1_000));

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(wait_for(|| factory.connections().len() == 1, Duration::from_secs(5)));

    // Not reaped before the timeout
    client.set_read_timeout(Some(Duration::from_millis(600))).unwrap();
    let mut buf = [0u8; 1];
    match client.read(&mut buf) {
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
        other => panic!("connection died too early: {other:?}"),
    }

    // Reaped within timeout + one tick of jitter (plus CI slack)
    assert_closed_within(&mut client, Duration::from_secs(3));
    assert!(wait_for(|| factory.connections().is_empty(), Duration::from_secs(2)));

    factory.shutdown();
}

#[test]
fn test_traffic_extends_connection_lifetime() {
    let (mut factory, addr) = start_server(0, test_config(1_000));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // One byte every 500ms for 4s; every round trip proves the connection
    // outlived the sessionless timeout thanks to the touch on each I/O
    for i in 0..8u8 {
        echo_roundtrip(&mut client, &[i]);
        thread::sleep(Duration::from_millis(500));
    }
    assert_eq!(factory.connections().len(), 1);

    factory.shutdown();
}

#[test]
fn test_reconfigure_moves_listener() {
    let (mut factory, old_addr) = start_server(0, test_config(10_000));

    let mut existing: Vec<TcpStream> = (0..10)
        .map(|_| {
            let s = TcpStream::connect(old_addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            s
        })
        .collect();
    assert!(wait_for(|| factory.connections().len() == 10, Duration::from_secs(5)));

    factory.reconfigure("127.0.0.1:0".parse().unwrap()).unwrap();
    let new_addr = factory.local_addr().unwrap();
    assert_ne!(old_addr, new_addr);

    // New accepts on the old port fail promptly
    assert!(
        wait_for(|| TcpStream::connect(old_addr).is_err(), Duration::from_secs(1)),
        "old listen address still accepting"
    );

    // ... the new port accepts ...
    let mut fresh = TcpStream::connect(new_addr).unwrap();
    fresh.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    echo_roundtrip(&mut fresh, b"fresh");

    // ... and every pre-existing connection is still serviceable
    for (i, client) in existing.iter_mut().enumerate() {
        echo_roundtrip(client, format!("survivor {i}").as_bytes());
    }

    factory.shutdown();
}

#[test]
fn test_graceful_shutdown() {
    let (mut factory, addr) = start_server(0, test_config(10_000));

    let mut clients: Vec<TcpStream> = (0..100)
        .map(|_| {
            let s = TcpStream::connect(addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            s
        })
        .collect();
    assert!(wait_for(|| factory.connections().len() == 100, Duration::from_secs(10)));

    // Keep the herd busy so shutdown races live I/O
    for (i, client) in clients.iter_mut().enumerate() {
        client.write_all(&[i as u8]).unwrap();
    }

    let started = Instant::now();
    factory.shutdown();
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(3),
        "shutdown exceeded the worker drain deadline: {elapsed:?}"
    );
    assert!(factory.connections().is_empty());

    // The listen socket no longer accepts
    assert!(wait_for(|| TcpStream::connect(addr).is_err(), Duration::from_secs(1)));

    // Every client observes its socket closing
    for mut client in clients {
        assert_closed_within(&mut client, Duration::from_secs(2));
    }
}

#[test]
fn test_connection_info_snapshot() {
    let (mut factory, addr) = start_server(0, test_config(10_000));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    echo_roundtrip(&mut client, b"count me");

    let info = factory.all_connection_info(false);
    assert_eq!(info.len(), 1);
    let entry = &info[0];
    assert!(entry.contains_key("remote_socket_address"));
    assert!(entry["bytes_received"].as_u64().unwrap() >= 8);

    // Brief mode omits the counters
    let brief = factory.all_connection_info(true);
    assert!(!brief[0].contains_key("bytes_received"));

    factory.reset_all_connection_stats();
    let info = factory.all_connection_info(false);
    assert_eq!(info[0]["bytes_received"].as_u64().unwrap(), 0);

    factory.shutdown();
}
