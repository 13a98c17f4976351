//! Helpers for running load balancer servers in the background.

use std::net::SocketAddr;

use tlb::{config::Listener, Config, Master, Server, State};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

/// Waits until the server is listening and returns its address.
pub async fn listening_address(state: &mut watch::Receiver<State>) -> SocketAddr {
    let state = state
        .wait_for(|state| matches!(state, State::Listening(_)))
        .await
        .unwrap();

    match *state {
        State::Listening(addr) => addr,
        _ => unreachable!(),
    }
}

/// Starts a server in the background with the given config, returning the
/// address once it's listening. The server runs until the test ends.
pub async fn spawn_server(config: Listener) -> (SocketAddr, JoinHandle<()>) {
    let server = Server::init(config).unwrap();
    let mut state = server.subscribe();

    let handle = tokio::task::spawn(async {
        server.run().await.unwrap();
    });

    (listening_address(&mut state).await, handle)
}

/// Starts a server in the background with the given config and provides
/// access to shutdown trigger and state updates.
pub async fn spawn_server_with_controllers(
    config: Listener,
) -> (
    SocketAddr,
    JoinHandle<()>,
    impl FnOnce(),
    watch::Receiver<State>,
) {
    let (handle, shutdown, mut state) = spawn_unbound_server(config);
    let addr = listening_address(&mut state).await;

    (addr, handle, shutdown, state)
}

/// Like [`spawn_server_with_controllers`] but returns right away, the server
/// might not be listening yet.
pub fn spawn_unbound_server(
    config: Listener,
) -> (JoinHandle<()>, impl FnOnce(), watch::Receiver<State>) {
    let (tx, rx) = oneshot::channel();

    let server = Server::init(config).unwrap().shutdown_on(rx);
    let state = server.subscribe();

    let handle = tokio::task::spawn(async {
        server.run().await.unwrap();
    });

    (handle, || tx.send(()).unwrap(), state)
}

/// Launches a master task in the background, returning the addresses of all
/// its servers once they're listening.
pub async fn spawn_master(
    config: Config,
) -> (
    Vec<SocketAddr>,
    JoinHandle<Result<(), tlb::Error>>,
    impl FnOnce(),
    Vec<watch::Receiver<State>>,
) {
    let (tx, rx) = oneshot::channel();

    let master = Master::init(&config).unwrap().shutdown_on(rx);
    let mut states = master.states();

    let handle = tokio::task::spawn(master.run());

    let mut addrs = Vec::new();
    for state in &mut states {
        addrs.push(listening_address(state).await);
    }

    (addrs, handle, || tx.send(()).unwrap(), states)
}
