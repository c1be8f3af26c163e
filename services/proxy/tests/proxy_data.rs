//! The data path itself: byte accounting, idle timeouts, connection
//! draining, and the UDP forwarding loop.


use std::time::Duration;

use harness::{backend_config, roundtrip, service_config, ReplyServer, UdpSink};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use capstan_proxy::Registry;

#[tokio::test]
async fn bytes_are_counted_on_the_backend() {
    let b1 = ReplyServer::spawn().await.unwrap();

    let registry = Registry::new();
    let service = registry
        .update_service(
            service_config("s1", vec![backend_config("b1", b1.addr)]),
            false,
        )
        .await
        .unwrap();
    let addr = service.local_addr().unwrap();

    let reply = roundtrip(addr, b"hello").await.unwrap();

    let backend = service.get_backend("b1").await.unwrap();
    let mut stats = backend.stats();
    for _ in 0..100 {
        if stats.sent == 5 && stats.received == reply.len() as u64 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        stats = backend.stats();
    }
    assert_eq!(stats.sent, 5, "bytes written to the upstream");
    assert_eq!(stats.received, reply.len() as u64, "bytes read back");
    assert_eq!(stats.conns, 1);

    let service_stats = service.stats().await;
    assert_eq!(service_stats.sent, 5);
    assert_eq!(service_stats.received, reply.len() as u64);

    registry.stop_all().await;
}

#[tokio::test]
async fn idle_client_is_disconnected_after_timeout() {
    let b1 = ReplyServer::spawn().await.unwrap();

    let mut cfg = service_config("s1", vec![backend_config("b1", b1.addr)]);
    cfg.client_timeout = 100;

    let registry = Registry::new();
    let service = registry.update_service(cfg, false).await.unwrap();
    let addr = service.local_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"x").await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = conn.read(&mut buf).await.unwrap();
    assert!(n > 0);

    // Go idle; the proxy must close the connection after the deadline.
    let read_result = timeout(Duration::from_secs(2), conn.read(&mut buf)).await;
    match read_result {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes after idle timeout"),
        Err(_) => panic!("connection survived the idle timeout"),
    }

    // Both shovels exited, so the backend drains to zero active.
    let backend = service.get_backend("b1").await.unwrap();
    for _ in 0..100 {
        if backend.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(backend.active_count(), 0);

    registry.stop_all().await;
}

#[tokio::test]
async fn zero_timeout_disables_the_idle_deadline() {
    let b1 = ReplyServer::spawn().await.unwrap();

    let registry = Registry::new();
    let service = registry
        .update_service(
            service_config("s1", vec![backend_config("b1", b1.addr)]),
            false,
        )
        .await
        .unwrap();
    let addr = service.local_addr().unwrap();

    let mut conn = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Still alive after sitting idle.
    conn.write_all(b"x").await.unwrap();
    let mut buf = vec![0u8; 256];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(buf[..n], *b1.addr.to_string().as_bytes());

    registry.stop_all().await;
}

#[tokio::test]
async fn udp_datagrams_are_forwarded() {
    let sink = UdpSink::spawn().await.unwrap();

    let mut backend = backend_config("b1", sink.addr);
    backend.network = "udp".to_string();
    let mut cfg = service_config("u1", vec![backend]);
    cfg.network = "udp".to_string();

    let registry = Registry::new();
    let service = registry.update_service(cfg, false).await.unwrap();
    let addr = service.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", addr).await.unwrap();

    for _ in 0..100 {
        if sink.datagram_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.datagram_count(), 1);
    assert_eq!(sink.bytes.load(std::sync::atomic::Ordering::Relaxed), 4);

    let stats = service.stats().await;
    assert_eq!(stats.received, 4, "datagram counted on receive");
    assert_eq!(stats.sent, 4, "datagram counted on send");

    registry.stop_all().await;
}
