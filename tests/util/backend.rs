//! Backend servers for integration tests.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tlb::config::Backend;
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

use super::tcp::usable_tcp_listener;

/// Starts a backend server in the background that sends back everything it
/// receives, returning the listening address and task handle.
pub fn spawn_echo_backend() -> (SocketAddr, JoinHandle<()>) {
    let (listener, addr) = usable_tcp_listener();

    (addr, spawn_echo_backend_on(listener))
}

/// Same as [`spawn_echo_backend`] but with a listener chosen by the caller.
pub fn spawn_echo_backend_on(listener: TcpListener) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::task::spawn(echo(stream));
        }
    })
}

async fn echo(mut stream: TcpStream) {
    let (mut read, mut write) = stream.split();

    if io::copy(&mut read, &mut write).await.is_ok() {
        let _ = write.shutdown().await;
    }
}

/// Starts a backend that answers every connection with its `tag` and closes
/// it, counting the connections it gets. This is useful for testing load
/// balancers, the tag tells which backend served a connection.
pub fn spawn_tagged_backend(tag: u8, weight: usize) -> (Backend, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let owned_counter = counter.clone();

    let (listener, addr) = usable_tcp_listener();

    tokio::task::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::Relaxed);

            tokio::task::spawn(async move {
                let _ = stream.write_all(&[tag]).await;
                let _ = stream.shutdown().await;

                // Wait for the other side to close so that nothing is reset.
                let mut sink = Vec::new();
                let _ = stream.read_to_end(&mut sink).await;
            });
        }
    });

    (backend(addr, weight), owned_counter)
}

/// Same as [`spawn_tagged_backend`] but spawns multiple backends. Tags are
/// the positions in `weights`.
pub fn spawn_tagged_backends(weights: &[usize]) -> (Vec<Backend>, Vec<Arc<AtomicUsize>>) {
    let mut backends = Vec::new();
    let mut counters = Vec::new();

    for (tag, weight) in weights.iter().enumerate() {
        let (backend, counter) = spawn_tagged_backend(tag as u8, *weight);
        backends.push(backend);
        counters.push(counter);
    }

    (backends, counters)
}

pub fn backend(addr: SocketAddr, weight: usize) -> Backend {
    Backend::new(addr.ip().to_string(), addr.port(), weight)
}

pub fn counts(counters: &[Arc<AtomicUsize>]) -> Vec<usize> {
    counters
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .collect()
}
