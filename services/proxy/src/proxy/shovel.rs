//! Bidirectional byte copying between a client and an upstream connection.
//!
//! Each proxied connection runs two independent half-duplex copy tasks.
//! Every read carries that half's idle deadline (client timeout on the
//! client half, server timeout on the upstream half); a zero timeout
//! disables the deadline. Clean closure half-closes the peer's write side
//! and lets the opposite direction drain; any other I/O error flips a
//! shared abort channel so both halves exit promptly and the sockets
//! close.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use super::backend::{Backend, ConnectionGuard};

const COPY_BUFFER_SIZE: usize = 8192;

/// Wire a client connection to an upstream connection and return. Bytes
/// written to the upstream count as `sent` on the backend, bytes read back
/// as `rcvd`. The guard is dropped (decrementing `active` exactly once)
/// after both directions have exited.
pub fn spawn(
    client: TcpStream,
    upstream: TcpStream,
    backend: Arc<Backend>,
    client_timeout: Duration,
    server_timeout: Duration,
    guard: ConnectionGuard,
) {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let (abort_tx, abort_rx) = watch::channel(false);

    let to_upstream = {
        let backend = Arc::clone(&backend);
        let abort_tx = abort_tx.clone();
        let abort_rx = abort_rx.clone();
        tokio::spawn(async move {
            copy_half(client_read, upstream_write, client_timeout, abort_tx, abort_rx, |n| {
                backend.add_sent(n)
            })
            .await;
        })
    };

    let to_client = tokio::spawn(async move {
        copy_half(upstream_read, client_write, server_timeout, abort_tx, abort_rx, |n| {
            backend.add_rcvd(n)
        })
        .await;
    });

    tokio::spawn(async move {
        let _ = to_upstream.await;
        let _ = to_client.await;
        drop(guard);
    });
}

async fn copy_half<F: Fn(u64)>(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    idle_timeout: Duration,
    abort_tx: watch::Sender<bool>,
    mut abort_rx: watch::Receiver<bool>,
    count: F,
) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = abort_rx.changed() => return,
            result = read_with_idle(&mut read, &mut buf, idle_timeout) => match result {
                Ok(0) => {
                    // Clean closure: half-close the peer and let the other
                    // direction drain on its own.
                    let _ = write.shutdown().await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "Connection copy ended");
                    let _ = abort_tx.send(true);
                    return;
                }
            },
        };

        if let Err(e) = write.write_all(&buf[..n]).await {
            debug!(error = %e, "Connection write failed");
            let _ = abort_tx.send(true);
            return;
        }
        count(n as u64);
    }
}

async fn read_with_idle(
    read: &mut OwnedReadHalf,
    buf: &mut [u8],
    idle: Duration,
) -> io::Result<usize> {
    if idle.is_zero() {
        return read.read(buf).await;
    }
    match tokio::time::timeout(idle, read.read(buf)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
    }
}
