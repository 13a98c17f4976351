use std::{
    future::{self, Future},
    pin::Pin,
    time::Duration,
};

use tokio::{
    sync::{broadcast, watch},
    task::JoinSet,
};
use tracing::{error, info, warn};

use super::server::{Server, State};
use crate::{config::Config, Error};

/// The master task is responsible for creating, spawning and shutting down all
/// the [`Server`] instances described in the configuration file.
///
/// # Replicas
///
/// The configuration file allows a single listener to bind multiple
/// addresses:
///
/// ```toml
/// [[listener]]
///
/// listen = ["127.0.0.1:8080", "127.0.0.1:8081"]
/// backends = ["127.0.0.1:9000"]
/// ```
///
/// Instead of managing multiple sockets within one [`Server`], we create a
/// "replica" for each listening address. A replica is just another [`Server`]
/// with the same backends but a different listening socket, see
/// [`Config::listeners`]. Replicas don't share scheduler state, each one
/// starts its own round robin cycle.
///
/// # Shutdown
///
/// Here's a diagram using SIGTERM as the top shutdown event:
///
/// ```text
///                         +---------+
///                         | SIGTERM |
///                         +---------+
///                              |
///                              V
///                         +--------+
///                         | Master |
///                         +--------+
///                              |
///                              | Forward the signal to each server.
///                              |
///               +--------------+--------------+
///               |                             |
///               v                             v
///          +----------+                 +----------+
///          | Server 1 |                 | Server 2 |
///          +----------+                 +----------+
///               |                             |
///               | Drain workers               |
///               |                             |
///       +-------+-------+             +-------+-------+
///       |               |             |               |
///       v               v             v               v
/// +----------+   +----------+   +----------+   +----------+
/// | Task 1.1 |   | Task 1.2 |   | Task 2.1 |   | Task 2.2 |
/// +----------+   +----------+   +----------+   +----------+
/// ```
///
/// Servers have [`Config::grace_period`] to finish their shutdown sequence.
/// When it runs out the master cancels whatever is left and returns, so the
/// process can exit even if some server is stuck.
pub struct Master {
    /// All the servers that the master has spawned.
    servers: Vec<Server>,

    /// Subscriptions to state updates from each server.
    states: Vec<watch::Receiver<State>>,

    /// Shutdown future. The master polls this future and when it's ready it
    /// sends the shutdown signal to all the servers, then waits for them to
    /// finish their pending tasks.
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,

    /// Shutdown notifications channel. Spawned servers are subscribed to this
    /// channel and can receive the shutdown signal.
    shutdown_notify: broadcast::Sender<()>,

    /// Maximum time given to the servers once shutdown starts.
    grace_period: Duration,
}

impl Master {
    /// Creates one [`Server`] for each listen address in the configuration.
    /// Sockets are not bound yet, see [`Server::run`].
    pub fn init(config: &Config) -> Result<Self, Error> {
        let mut servers = Vec::new();
        let mut states = Vec::new();
        let shutdown = Box::pin(future::pending());
        let (shutdown_notify, _) = broadcast::channel(1);

        for listener in config.listeners() {
            info!(
                listener = %listener.log_name,
                algorithm = ?listener.algorithm,
                buffer_size = listener.buffer_size,
                backends = listener.backends.len(),
                "Starting listener"
            );

            let server = Server::init(listener)?;
            states.push(server.subscribe());
            servers.push(server);
        }

        Ok(Self {
            servers,
            states,
            shutdown,
            shutdown_notify,
            grace_period: config.grace_period,
        })
    }

    /// When `future` is ready, the graceful shutdown process begins. See
    /// [`Master`] definition and [`Server`].
    pub fn shutdown_on(mut self, future: impl Future + Send + 'static) -> Self {
        self.servers = self
            .servers
            .into_iter()
            .map(|server| {
                let mut shutdown_notification = self.shutdown_notify.subscribe();
                server.shutdown_on(async move { shutdown_notification.recv().await })
            })
            .collect();

        self.shutdown = Box::pin(async move {
            future.await;
        });

        self
    }

    /// State receivers of all the servers, in the same order as
    /// [`Config::listeners`].
    pub fn states(&self) -> Vec<watch::Receiver<State>> {
        self.states.clone()
    }

    /// All the servers start binding their sockets and accepting
    /// connections. Returns after the shutdown future completes and every
    /// server is done or the grace period runs out, or if a server fails.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            servers,
            shutdown,
            shutdown_notify,
            grace_period,
            ..
        } = self;

        let mut set = JoinSet::new();

        for server in servers {
            set.spawn(server.run());
        }

        let mut first_error = watch_servers(&mut set, shutdown).await;

        let _ = shutdown_notify.send(());

        shutdown_all(&mut set, grace_period, &mut first_error).await;

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

/// Waits until `shutdown` completes or some server stops on its own, which
/// only happens if it failed. Returns the failure, if any.
async fn watch_servers(
    set: &mut JoinSet<Result<(), Error>>,
    mut shutdown: impl Future<Output = ()> + Unpin,
) -> Option<Error> {
    loop {
        tokio::select! {
            Some(result) = set.join_next() => match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => {
                    error!(error = %err, "Listener failed, shutting down all listeners");
                    return Some(err);
                }
                Err(err) => {
                    error!(error = %err, "Listener task panicked, shutting down all listeners");
                    return Some(err.into());
                }
            },

            _ = &mut shutdown => {
                info!("Sending shutdown signal to all listeners");
                return None;
            }
        }
    }
}

/// Waits for every server in `set` to finish, giving up after
/// `grace_period`. Servers still running at that point are cancelled.
async fn shutdown_all(
    set: &mut JoinSet<Result<(), Error>>,
    grace_period: Duration,
    first_error: &mut Option<Error>,
) {
    let started = tokio::time::Instant::now();

    let drain = async {
        while let Some(result) = set.join_next().await {
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => err.into(),
            };

            error!(error = %err, "Listener failed while shutting down");
            first_error.get_or_insert(err);
        }
    };

    match tokio::time::timeout(grace_period, drain).await {
        Ok(()) => info!(elapsed = ?started.elapsed(), "All listeners shut down"),
        Err(_) => {
            warn!(
                remaining = set.len(),
                ?grace_period,
                "Listeners could not stop in time, exiting anyway"
            );

            // Cancelled servers drop their workers, which closes the
            // remaining connections.
            set.abort_all();
            while set.join_next().await.is_some() {}
        }
    }
}
