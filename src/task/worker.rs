//! Connection proxy. A worker owns one client connection, connects to the
//! backend chosen for it and relays bytes in both directions until both
//! sides are done.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::server::{wait_until, Context, State};
use crate::config::Backend;

/// Handle to a running (or finished) worker task. The handle stays in the
/// [`super::active::ActiveSet`] of the listener until the reaper removes it.
/// Dropping the handle cancels the task.
pub(crate) struct Worker {
    link: Arc<Link>,
    task: JoinHandle<()>,
}

/// State shared between the worker task and the background tasks of the
/// listener.
struct Link {
    client_addr: SocketAddr,

    backend: Backend,

    /// Raised by the worker when the backend can't be reached, lowered by the
    /// retry coordinator when it takes the client connection.
    failed_to_connect: AtomicBool,

    /// Goes from `true` to `false` exactly once, when the task finishes or
    /// is cancelled.
    alive: AtomicBool,

    /// Client connection left behind after a failed connect, so that it can
    /// be given to another worker.
    parked_client: Mutex<Option<TcpStream>>,
}

/// A client connection whose backend could not be reached.
pub(crate) struct Failure {
    pub client: TcpStream,
    pub client_addr: SocketAddr,
    pub backend: Backend,
}

impl Worker {
    /// Spawns a new worker task that proxies `client` to `backend`.
    pub fn spawn(
        context: Arc<Context>,
        client: TcpStream,
        client_addr: SocketAddr,
        backend: Backend,
    ) -> Self {
        let link = Arc::new(Link::new(client_addr, backend));
        let task = tokio::task::spawn(serve(Arc::clone(&link), client, context));

        Self { link, task }
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.link.client_addr
    }

    pub fn backend(&self) -> &Backend {
        &self.link.backend
    }

    pub fn is_alive(&self) -> bool {
        self.link.alive.load(Ordering::Acquire)
    }

    /// A worker can be removed once it's done and nobody needs its client
    /// connection anymore. Failed workers have to wait until the retry
    /// coordinator takes their failure, otherwise the client would be lost.
    pub fn is_reapable(&self) -> bool {
        !self.is_alive() && !self.link.failed_to_connect.load(Ordering::Acquire)
    }

    /// Lowers the failure flag and returns the parked client connection if
    /// the flag was raised. Only the first call after a failure gets the
    /// connection.
    pub fn take_failure(&self) -> Option<Failure> {
        if !self.link.failed_to_connect.swap(false, Ordering::AcqRel) {
            return None;
        }

        let client = self.link.take_client()?;

        Some(Failure {
            client,
            client_addr: self.link.client_addr,
            backend: self.link.backend.clone(),
        })
    }

    /// Waits at most `timeout` for the task to finish. Returns `true` if it
    /// did.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        if self.task.is_finished() {
            return true;
        }

        tokio::time::timeout(timeout, &mut self.task).await.is_ok()
    }

    /// Cancels the task. Both sockets are closed when the task is dropped.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Link {
    fn new(client_addr: SocketAddr, backend: Backend) -> Self {
        Self {
            client_addr,
            backend,
            failed_to_connect: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            parked_client: Mutex::new(None),
        }
    }

    /// Keeps the client connection and raises the failure flag, in this
    /// order, so whoever sees the flag also finds the connection.
    fn park(&self, client: TcpStream) {
        *self
            .parked_client
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(client);

        self.failed_to_connect.store(true, Ordering::Release);
    }

    fn take_client(&self) -> Option<TcpStream> {
        self.parked_client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Lowers the alive flag when dropped, which happens both when the task
/// returns and when it's aborted.
struct AliveGuard<'a>(&'a Link);

impl Drop for AliveGuard<'_> {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::Release);
    }
}

/// Body of the worker task. Runs until the connection is done or the
/// listener starts draining connections.
async fn serve(link: Arc<Link>, client: TcpStream, context: Arc<Context>) {
    let _alive = AliveGuard(&link);
    let mut state = context.subscribe();

    tokio::select! {
        _ = proxy(&link, client, &context) => {}

        _ = wait_until(&mut state, State::is_draining) => {
            debug!(
                listener = %context.config.log_name,
                client = %link.client_addr,
                backend = %link.backend,
                "Connection stopped by shutdown"
            );
        }
    }
}

async fn proxy(link: &Link, client: TcpStream, context: &Context) {
    let log_name = &context.config.log_name;

    let backend = match connect(&link.backend, context.config.connect_timeout).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                listener = %log_name,
                client = %link.client_addr,
                backend = %link.backend,
                error = %err,
                "Failed to connect to backend"
            );
            link.park(client);
            context.failures.notify_one();
            return;
        }
    };

    debug!(
        listener = %log_name,
        client = %link.client_addr,
        backend = %link.backend,
        "Connected to backend"
    );

    match relay(client, backend, context.config.buffer_size).await {
        Ok((sent, received)) => info!(
            listener = %log_name,
            client = %link.client_addr,
            backend = %link.backend,
            sent,
            received,
            "Connection closed"
        ),
        Err(err) => warn!(
            listener = %log_name,
            client = %link.client_addr,
            backend = %link.backend,
            error = %err,
            "Connection aborted"
        ),
    }
}

/// Opens a connection to `backend`, giving up after `timeout`.
async fn connect(backend: &Backend, timeout: Duration) -> io::Result<TcpStream> {
    let address = (backend.address.as_str(), backend.port);

    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer after {timeout:?}"),
        )),
    }
}

/// Relays bytes between `client` and `backend` reading at most `buffer_size`
/// bytes at a time. When one side stops sending, the write half of the other
/// side is shut down and the opposite direction keeps going until it's done
/// as well. Any I/O error ends both directions. Returns the number of bytes
/// sent to the backend and received from it.
pub(crate) async fn relay(
    mut client: TcpStream,
    mut backend: TcpStream,
    buffer_size: usize,
) -> io::Result<(u64, u64)> {
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let upstream = copy(&mut client_read, &mut backend_write, buffer_size);
    let downstream = copy(&mut backend_read, &mut client_write, buffer_size);

    tokio::try_join!(upstream, downstream)
}

async fn copy<R, W>(reader: &mut R, writer: &mut W, buffer_size: usize) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);
    let mut total = 0;

    loop {
        buffer.clear();

        if reader.read_buf(&mut buffer).await? == 0 {
            break;
        }

        writer.write_all(&buffer).await?;
        total += buffer.len() as u64;
    }

    writer.shutdown().await?;

    Ok(total)
}

#[cfg(test)]
impl Worker {
    /// Worker whose task never finishes on its own. Tests drive its flags
    /// with [`Worker::finish`] and [`Worker::fail`].
    pub fn idle(client_addr: SocketAddr, backend: Backend) -> Self {
        Self::holding(client_addr, backend, ())
    }

    /// Same as [`Worker::idle`], the task keeps `value` until it's cancelled.
    pub fn holding<T: Send + 'static>(client_addr: SocketAddr, backend: Backend, value: T) -> Self {
        let link = Arc::new(Link::new(client_addr, backend));
        let task = tokio::task::spawn(async move {
            let _value = value;
            std::future::pending::<()>().await
        });

        Self { link, task }
    }

    pub fn finish(&self) {
        self.link.alive.store(false, Ordering::Release);
    }

    pub fn fail(&self, client: TcpStream) {
        self.link.park(client);
        self.finish();
    }
}
