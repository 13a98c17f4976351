//! TCP utilities for integration tests.

use std::net::SocketAddr;

use tokio::{
    self,
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
};

/// Creates a socket binding it to port "0", which let's the OS pick any
/// available TCP port. This is useful because tests are run in parallel and
/// we don't want socket addresses to collide, but we still want to know
/// the socket address.
pub fn usable_socket() -> (TcpSocket, SocketAddr) {
    let socket = TcpSocket::new_v4().unwrap();

    #[cfg(not(windows))]
    socket.set_reuseaddr(true).unwrap();

    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();

    (socket, addr)
}

/// Same as [`usable_socket`] but already configured for listening.
pub fn usable_tcp_listener() -> (TcpListener, SocketAddr) {
    let (socket, addr) = usable_socket();
    let listener = socket.listen(1024).unwrap();

    (listener, addr)
}

/// Address where nothing is listening. Connecting to it is refused right
/// away, at least until someone binds it again.
pub fn unused_address() -> SocketAddr {
    let (listener, addr) = usable_tcp_listener();
    drop(listener);

    addr
}

/// Attempts to connect to a TCP server that's running as a Tokio task for a
/// number of retries. Each failed attempts yields the execution back to the
/// runtime, allowing Tokio to progress pending tasks. If all the attempts fail,
/// the function panics and tests are stopped. This should work with both single
/// threaded runtime and multithreaded runtime.
pub async fn ping_tcp_server(addr: SocketAddr) {
    let retries = 10;

    for _ in 0..retries {
        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                stream.shutdown().await.unwrap();
                return;
            }
            Err(_) => tokio::task::yield_now().await,
        }
    }

    panic!("Could not connect to server {addr}");
}

/// Connects to `addr`, sends `payload`, closes the write half and returns
/// everything received until the other side closes. Sending and receiving
/// happen at the same time, so payloads larger than the socket buffers don't
/// block.
pub async fn send_and_receive(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut read, mut write) = stream.into_split();

    let send = async {
        write.write_all(payload).await.unwrap();
        write.shutdown().await.unwrap();
    };

    let receive = async {
        let mut received = Vec::new();
        read.read_to_end(&mut received).await.unwrap();
        received
    };

    let ((), received) = tokio::join!(send, receive);

    received
}

/// Opens a connection to `addr` and checks that bytes go through in both
/// directions. The connection is returned open.
pub async fn open_echo_connection(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"ping").await.unwrap();

    let mut buf = [0; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    stream
}
