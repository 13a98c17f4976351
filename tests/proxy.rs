//! Load balancer integration tests.

mod util;

use std::time::Duration;

use tlb::{
    config::{Algorithm, Endpoint},
    Config, Server, ShutdownState, State,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::util::{
    backend::{backend, counts, spawn_echo_backend, spawn_echo_backend_on, spawn_tagged_backends},
    config,
    server::{spawn_master, spawn_server, spawn_server_with_controllers, spawn_unbound_server},
    tcp::{
        open_echo_connection,
        ping_tcp_server,
        send_and_receive,
        unused_address,
        usable_tcp_listener,
    },
};

/// Upper bound for anything that should happen "soon" in these tests.
const PATIENCE: Duration = Duration::from_secs(5);

/// Sends one connection through the load balancer and returns the tag of
/// the backend that served it.
async fn served_by(addr: std::net::SocketAddr) -> u8 {
    let received = send_and_receive(addr, b"").await;
    assert_eq!(received.len(), 1, "expected a single tag byte");

    received[0]
}

#[tokio::test]
async fn proxy_preserves_bytes() {
    let (backend_addr, _) = spawn_echo_backend();

    let mut listener = config::round_robin(vec![backend(backend_addr, 1)]);
    listener.buffer_size = 16;

    let (proxy_addr, _) = spawn_server(listener).await;

    ping_tcp_server(backend_addr).await;

    let small = b"Hello world".to_vec();
    assert_eq!(send_and_receive(proxy_addr, &small).await, small);

    // Much bigger than the relay buffer and the socket buffers.
    let large: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(send_and_receive(proxy_addr, &large).await, large);

    assert_eq!(send_and_receive(proxy_addr, b"").await, b"");
}

#[tokio::test]
async fn round_robin_load_balancing() {
    let (backends, counters) = spawn_tagged_backends(&[1, 1, 1]);
    let (proxy_addr, _) = spawn_server(config::round_robin(backends)).await;

    let mut tags = Vec::new();
    for _ in 0..9 {
        tags.push(served_by(proxy_addr).await);
    }

    assert_eq!(tags, [0, 1, 2, 0, 1, 2, 0, 1, 2]);
    assert_eq!(counts(&counters), [3, 3, 3]);
}

#[tokio::test]
async fn weighted_round_robin_load_balancing() {
    let weights = [3, 1];
    let (backends, counters) = spawn_tagged_backends(&weights);
    let listener = config::listener(backends, Algorithm::WeightedRoundRobin);
    let (proxy_addr, _) = spawn_server(listener).await;

    let cycles = 3;

    for cycle in 1..=cycles {
        let mut tags = Vec::new();
        for _ in 0..weights.iter().sum() {
            tags.push(served_by(proxy_addr).await);
        }

        // Each backend gets its whole share in a row.
        assert_eq!(tags, [0, 0, 0, 1]);

        for (count, weight) in counts(&counters).iter().zip(&weights) {
            assert_eq!(*count, weight * cycle);
        }
    }
}

#[tokio::test]
async fn random_load_balancing_reaches_every_backend() {
    let (backends, counters) = spawn_tagged_backends(&[1, 1, 1]);
    let listener = config::listener(backends, Algorithm::Random);
    let (proxy_addr, _) = spawn_server(listener).await;

    for _ in 0..60 {
        served_by(proxy_addr).await;
    }

    let counts = counts(&counters);
    assert_eq!(counts.iter().sum::<usize>(), 60);
    assert!(counts.iter().all(|count| *count > 0), "{counts:?}");
}

#[tokio::test]
async fn failed_connections_are_retried_on_another_backend() {
    let (alive, _) = spawn_echo_backend();
    let dead = unused_address();

    let listener = config::round_robin(vec![backend(dead, 1), backend(alive, 1)]);
    let (proxy_addr, _) = spawn_server(listener).await;

    // Half of these are scheduled on the dead backend first.
    for i in 0..4 {
        let payload = format!("connection {i}");
        let received = send_and_receive(proxy_addr, payload.as_bytes());
        let received = tokio::time::timeout(PATIENCE, received).await.unwrap();

        assert_eq!(received, payload.as_bytes());
    }
}

#[tokio::test]
async fn single_backend_is_retried_until_it_comes_back() {
    let backend_addr = unused_address();

    let (proxy_addr, _) = spawn_server(config::round_robin(vec![backend(backend_addr, 1)])).await;

    let client = tokio::task::spawn(send_and_receive(proxy_addr, b"Hello world"));

    // Let a few connection attempts fail.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!client.is_finished());

    let listener = TcpListener::bind(backend_addr).await.unwrap();
    spawn_echo_backend_on(listener);

    let received = tokio::time::timeout(PATIENCE, client).await.unwrap().unwrap();
    assert_eq!(received, b"Hello world");
}

#[tokio::test]
async fn bind_is_retried_until_address_is_free() {
    let (backend_addr, _) = spawn_echo_backend();
    let (occupied, addr) = usable_tcp_listener();

    let bind = Endpoint::new(addr.ip().to_string(), addr.port());
    let listener = config::listener_on(bind, vec![backend(backend_addr, 1)], Algorithm::RoundRobin);

    let (_, _shutdown, mut state) = spawn_unbound_server(listener);

    state
        .wait_for(|state| *state == State::Binding)
        .await
        .unwrap();

    // A couple of attempts fail while the port is taken.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*state.borrow(), State::Binding);

    drop(occupied);

    tokio::time::timeout(PATIENCE, state.wait_for(|state| *state == State::Listening(addr)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(send_and_receive(addr, b"rebound").await, b"rebound");
}

#[tokio::test]
async fn graceful_shutdown() {
    let (backend_addr, _) = spawn_echo_backend();

    let (proxy_addr, handle, shutdown, mut state) =
        spawn_server_with_controllers(config::round_robin(vec![backend(backend_addr, 1)])).await;

    // Long lived connections that never close on their own.
    let mut stream1 = open_echo_connection(proxy_addr).await;
    let mut stream2 = open_echo_connection(proxy_addr).await;

    // Shutdown the server.
    shutdown();

    // Now the server should know that there are still 2 pending connections.
    let draining = *state
        .wait_for(|state| {
            matches!(
                state,
                State::ShuttingDown(ShutdownState::Draining(_) | ShutdownState::Done)
            )
        })
        .await
        .unwrap();

    assert_eq!(draining, State::ShuttingDown(ShutdownState::Draining(2)));

    // If we try to connect again it should not allow us.
    assert!(TcpStream::connect(proxy_addr).await.is_err());

    // The server doesn't wait for the clients, it stops in bounded time.
    tokio::time::timeout(PATIENCE, handle).await.unwrap().unwrap();
    assert_eq!(*state.borrow(), State::ShuttingDown(ShutdownState::Done));

    // Both connections have been closed by the server.
    for stream in [&mut stream1, &mut stream2] {
        let mut buf = [0; 16];
        let _ = stream.write_all(b"are you there?").await;
        assert!(matches!(stream.read(&mut buf).await, Ok(0) | Err(_)));
    }
}

#[tokio::test]
async fn shutdown_without_connections() {
    let (backend_addr, _) = spawn_echo_backend();

    let (proxy_addr, handle, shutdown, state) =
        spawn_server_with_controllers(config::round_robin(vec![backend(backend_addr, 1)])).await;

    assert_eq!(send_and_receive(proxy_addr, b"done").await, b"done");

    shutdown();

    tokio::time::timeout(PATIENCE, handle).await.unwrap().unwrap();
    assert_eq!(*state.borrow(), State::ShuttingDown(ShutdownState::Done));
}

#[tokio::test]
async fn shutdown_while_binding() {
    let (backend_addr, _) = spawn_echo_backend();
    let (_occupied, addr) = usable_tcp_listener();

    let bind = Endpoint::new(addr.ip().to_string(), addr.port());
    let listener = config::listener_on(bind, vec![backend(backend_addr, 1)], Algorithm::RoundRobin);

    let (handle, shutdown, mut state) = spawn_unbound_server(listener);

    state
        .wait_for(|state| *state == State::Binding)
        .await
        .unwrap();

    shutdown();

    tokio::time::timeout(PATIENCE, handle).await.unwrap().unwrap();
    assert_eq!(*state.borrow(), State::ShuttingDown(ShutdownState::Done));
}

#[tokio::test]
async fn server_without_backends_is_rejected() {
    let listener = config::round_robin(Vec::new());

    assert!(matches!(Server::init(listener), Err(tlb::Error::NoBackends(_))));
}

#[tokio::test]
async fn master_runs_every_listener_and_shuts_down() {
    let (first, _) = spawn_echo_backend();
    let (second, _) = spawn_echo_backend();
    let (listen1, listen2) = (unused_address(), unused_address());

    let mut config: Config = format!(
        r#"
            grace_period = 3

            [[listener]]
            name = "first"
            listen = "{listen1}"
            backends = ["{first}"]

            [[listener]]
            name = "second"
            listen = "{listen2}"
            backends = [{{ address = "{second}", weight = 2 }}]
        "#
    )
    .parse()
    .unwrap();

    config.timings = config::fast_timings();

    let (addrs, handle, shutdown, states) = spawn_master(config).await;
    assert_eq!(addrs, [listen1, listen2]);

    for addr in &addrs {
        assert_eq!(send_and_receive(*addr, b"master").await, b"master");
    }

    let _open = open_echo_connection(addrs[0]).await;

    shutdown();

    tokio::time::timeout(PATIENCE, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    for state in &states {
        assert_eq!(*state.borrow(), State::ShuttingDown(ShutdownState::Done));
    }
}

#[tokio::test]
async fn master_grace_period_cuts_shutdown_short() {
    let (backend_addr, _) = spawn_echo_backend();
    let listen = unused_address();

    // Default timings pause for a whole second before joining connections,
    // way longer than the grace period.
    let config: Config = format!(
        r#"
            grace_period = 0.05

            [[listener]]
            listen = "{listen}"
            backends = ["{backend_addr}"]
        "#
    )
    .parse()
    .unwrap();

    let (addrs, handle, shutdown, states) = spawn_master(config).await;

    let mut open = open_echo_connection(addrs[0]).await;

    shutdown();

    tokio::time::timeout(Duration::from_millis(900), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // The listener never got to finish its own shutdown sequence.
    assert_eq!(
        *states[0].borrow(),
        State::ShuttingDown(ShutdownState::Draining(1))
    );

    // Cancelling the listener also closes its connections.
    let mut buf = [0; 16];
    let read = tokio::time::timeout(PATIENCE, open.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn cancelled_server_closes_its_connections() {
    let (backend_addr, _) = spawn_echo_backend();

    let (proxy_addr, handle, _shutdown, _) =
        spawn_server_with_controllers(config::round_robin(vec![backend(backend_addr, 1)])).await;

    let mut open = open_echo_connection(proxy_addr).await;

    // No shutdown signal, the server task is just dropped.
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let mut buf = [0; 16];
    let read = tokio::time::timeout(PATIENCE, open.read(&mut buf)).await.unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}
