use std::{
    future::{self, Future},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{watch, Notify},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info};

use super::{active::ActiveSet, reaper, retry, shutdown, worker::Worker};
use crate::{
    config::{self, Backend, Endpoint},
    sched::{Policy, Scheduler},
    Error,
};

/// Listen backlog for every socket.
const BACKLOG: u32 = 1024;

/// The [`Server`] struct represents a single listening socket from the config
/// file. It is responsible for binding the socket, accepting new connections
/// and spawning a worker task for each of them, as well as starting the
/// background tasks of the listener and gracefully stopping everything.
/// Here's a simple diagram describing the process:
///
/// ```text
///                     +--------+
///                     | Server |
///                     +--------+
///                         |
///                         v
///                     +--------+
///                     |  Bind  | <--+ retry
///                     +--------+ ---+
///                         |
///                         v
///                     +--------+
///                +--- | Select | ---+
///                |    +--------+    |
///                v                  v
///          +----------+       +----------+
///          |  Accept  |       | Shutdown |
///          +----------+       +----------+
///                |                  |
///                v                  v
///          +----------+       +----------+
///          | Dispatch |       |  Drain   |
///          +----------+       +----------+
///                |                  |
///                v                  v
/// +--------+   +--------+   +--------+   +--------+
/// | Task 1 |   | Task 2 |   | Task 3 |   | Task 4 |
/// +--------+   +--------+   +--------+   +--------+
/// ```
pub struct Server {
    /// State updates channel. Subscribers can use this to check the current
    /// [`State`] of this server.
    state: watch::Sender<State>,

    /// Configuration for this server.
    config: config::Listener,

    /// Scheduler built from the configured algorithm and backends.
    policy: Policy,

    /// Shutdown future, this can be anything, which allows us to easily write
    /// integration tests. When this future completes, the server starts the
    /// shutdown process.
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Represents the current state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Server has been created but is not running yet.
    Starting,

    /// Server is trying to bind its socket.
    Binding,

    /// Server is accepting incoming connections on the given address.
    Listening(SocketAddr),

    /// Server is gracefully shutting down.
    ShuttingDown(ShutdownState),
}

/// Represents a state in the graceful shutdown process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    /// The server has received the shutdown signal and won't accept more
    /// connections. Background tasks are stopping.
    Stopping,

    /// Connections that were still open have been asked to stop. This is
    /// the number of workers being drained.
    Draining(usize),

    /// Shutdown process complete.
    Done,
}

impl State {
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, Self::ShuttingDown(_))
    }

    /// Workers stop as soon as they see this.
    pub fn is_draining(&self) -> bool {
        matches!(
            self,
            Self::ShuttingDown(ShutdownState::Draining(_) | ShutdownState::Done)
        )
    }
}

/// Everything the tasks of a running server share. Workers get an [`Arc`] to
/// it as well, which is dropped when they finish.
pub(crate) struct Context {
    pub config: config::Listener,

    pub policy: Policy,

    pub active: ActiveSet,

    /// Workers notify the retry coordinator when they fail to connect so it
    /// doesn't have to wait for its next scan.
    pub failures: Notify,

    pub state: watch::Sender<State>,
}

impl Server {
    /// Initializes a [`Server`] with the given `config`. Nothing is bound yet,
    /// that happens in [`Server::run`] because binding is retried until it
    /// works. Subscribe to the server with [`Server::subscribe`] to learn the
    /// address once it's listening, which is needed for port 0.
    pub fn init(config: config::Listener) -> Result<Self, Error> {
        let policy = Policy::new(config.algorithm, config.backends.clone())
            .ok_or_else(|| Error::NoBackends(config.log_name.clone()))?;

        let (state, _) = watch::channel(State::Starting);

        // Don't shutdown on anything by default.
        let shutdown = Box::pin(future::pending());

        Ok(Self {
            state,
            config,
            policy,
            shutdown,
        })
    }

    /// The [`Server`] will poll the given `future` and whenever it completes,
    /// the graceful shutdown process starts. If only one server is
    /// instantiated, this could be called with [`crate::signal::termination`],
    /// but it can be any [`Future`] since we need customization for
    /// integration tests and spawning multiple servers using
    /// [`super::master::Master`].
    pub fn shutdown_on(mut self, future: impl Future + Send + 'static) -> Self {
        self.shutdown = Box::pin(async move {
            future.await;
        });

        self
    }

    /// By subscribing to this server the caller obtains a channel where the
    /// current state of the server can be read. This allows the server and
    /// caller to run on separate Tokio tasks while still allowing the caller
    /// to read the state.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// This is the entry point, by calling and `await`ing this function the
    /// server binds its socket and starts to process connections. It returns
    /// once the shutdown sequence is complete.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            state,
            config,
            policy,
            mut shutdown,
        } = self;

        let log_name = config.log_name.clone();

        state.send_replace(State::Binding);

        let listener = tokio::select! {
            listener = bind(&config) => listener,
            _ = &mut shutdown => {
                info!(listener = %log_name, "Received shutdown signal before binding");
                state.send_replace(State::ShuttingDown(ShutdownState::Done));
                return Ok(());
            }
        };

        let address = match listener.local_addr() {
            Ok(address) => address,
            Err(err) => {
                state.send_replace(State::ShuttingDown(ShutdownState::Done));
                return Err(err.into());
            }
        };

        let context = Arc::new(Context {
            config,
            policy,
            active: ActiveSet::new(),
            failures: Notify::new(),
            state,
        });

        let background = [
            tokio::task::spawn(reaper::run(Arc::clone(&context))),
            tokio::task::spawn(retry::run(Arc::clone(&context))),
        ];

        // Tasks don't outlive the server, even if this future is cancelled
        // halfway through the shutdown sequence.
        let _tasks = CancelOnDrop {
            active: &context.active,
            background: background.each_ref().map(JoinHandle::abort_handle),
        };

        context.state.send_replace(State::Listening(address));

        info!(
            listener = %log_name,
            %address,
            algorithm = ?context.config.algorithm,
            backends = %BackendList(context.policy.backends()),
            "Listening for connections"
        );

        let acceptor = Acceptor {
            listener,
            context: &context,
        };

        tokio::select! {
            _ = acceptor.listen() => {}
            _ = &mut shutdown => {
                info!(listener = %log_name, "Received shutdown signal");
            }
        }

        // Drop the listener to stop accepting new connections. This will cause
        // a "Connection Refused" error on any new client socket that attempts
        // to connect. Already connected sockets will still be able to send and
        // receive data until they're drained.
        drop(acceptor);

        shutdown::run(&context, background).await;

        info!(listener = %log_name, "Shutdown complete");

        Ok(())
    }
}

impl Context {
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// Spawns a worker that proxies `client` to `backend` and tracks it in the
    /// active set. If the listener is already shutting down the worker is
    /// cancelled right away, which closes the client connection.
    pub fn dispatch(self: &Arc<Self>, client: TcpStream, client_addr: SocketAddr, backend: Backend) {
        let worker = Worker::spawn(Arc::clone(self), client, client_addr, backend);

        if let Err(worker) = self.active.push(worker) {
            debug!(
                listener = %self.config.log_name,
                client = %client_addr,
                "Dropping connection, listener is shutting down"
            );
            worker.abort();
        }
    }
}

#[cfg(test)]
impl Context {
    /// Context of a server that never runs, for testing tasks in isolation.
    pub fn detached(config: config::Listener) -> Arc<Self> {
        let policy = Policy::new(config.algorithm, config.backends.clone()).unwrap();
        let (state, _) = watch::channel(State::Starting);

        Arc::new(Self {
            config,
            policy,
            active: ActiveSet::new(),
            failures: Notify::new(),
            state,
        })
    }
}

/// Cancels the background tasks and closes the active set when dropped.
/// Dropping the workers cancels them.
struct CancelOnDrop<'a> {
    active: &'a ActiveSet,
    background: [AbortHandle; 2],
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }

        drop(self.active.close());
    }
}

/// Accepts incoming connections and dispatches them to the backends chosen
/// by the scheduler.
struct Acceptor<'a> {
    /// Underlying TCP listener. We take ownership of this so that when this
    /// struct is dropped the socket is also dropped and we stop accepting
    /// connections.
    listener: TcpListener,

    /// Shared state of the server.
    context: &'a Arc<Context>,
}

impl Acceptor<'_> {
    /// Accept loop. Connections are dispatched in the order they're
    /// accepted. Errors are logged and don't stop the loop, this only returns
    /// when the future is dropped.
    async fn listen(&self) {
        let config = &self.context.config;

        loop {
            let (stream, client_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(
                        listener = %config.log_name,
                        error = %err,
                        "Failed to accept connection"
                    );
                    tokio::time::sleep(config.timings.accept_pause).await;
                    continue;
                }
            };

            let backend = self.context.policy.next_backend().clone();

            info!(
                listener = %config.log_name,
                client = %client_addr,
                %backend,
                "Dispatching connection"
            );

            self.context.dispatch(stream, client_addr, backend);
        }
    }
}

/// Binds the listening socket, trying again every
/// [`config::Timings::bind_retry`] until it works.
async fn bind(config: &config::Listener) -> TcpListener {
    loop {
        match try_bind(&config.bind).await {
            Ok(listener) => return listener,
            Err(err) => {
                error!(
                    listener = %config.log_name,
                    error = %err,
                    retry_in = ?config.timings.bind_retry,
                    "Failed to bind"
                );
                tokio::time::sleep(config.timings.bind_retry).await;
            }
        }
    }
}

async fn try_bind(endpoint: &Endpoint) -> io::Result<TcpListener> {
    let address = tokio::net::lookup_host((endpoint.address.as_str(), endpoint.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{endpoint} did not resolve to any address"),
            )
        })?;

    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    #[cfg(not(windows))]
    socket.set_reuseaddr(true)?;

    socket.bind(address)?;

    socket.listen(BACKLOG)
}

/// Waits until the state of the server matches `predicate`. Also returns if
/// the server is gone.
pub(crate) async fn wait_until(state: &mut watch::Receiver<State>, predicate: fn(&State) -> bool) {
    let _ = state.wait_for(predicate).await;
}

/// Formats backends as `a:1, b:2` for logs.
struct BackendList<'a>(&'a [Backend]);

impl std::fmt::Display for BackendList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, backend) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{backend} (weight {})", backend.weight)?;
        }

        Ok(())
    }
}
