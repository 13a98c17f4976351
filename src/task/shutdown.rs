//! Shutdown sequence of a single server. Every step has a time limit, so
//! the sequence finishes even if some connection refuses to stop:
//!
//! ```text
//!  +----------+     +----------+     +----------+     +------------+
//!  | Stopping | --> | Draining | --> | Escalate | --> | Terminated |
//!  +----------+     +----------+     +----------+     +------------+
//!       |                                                   ^
//!       |            no pending connections                 |
//!       +---------------------------------------------------+
//! ```

use std::time::Duration;

use tokio::{task::JoinHandle, time::sleep};
use tracing::{info, warn};

use super::{
    server::{Context, ShutdownState, State},
    worker::Worker,
};

/// Runs the shutdown sequence. The accept loop must be stopped already.
///
/// 1. Background tasks are told to stop and the active set is closed.
/// 2. Pending workers are asked to stop. After a pause each one is joined
///    with a short timeout.
/// 3. Survivors get another pause and a longer timeout. Whatever is still
///    running after that is cancelled and abandoned.
/// 4. Background tasks are joined and the server is done.
pub(super) async fn run(context: &Context, background: [JoinHandle<()>; 2]) {
    let timings = context.config.timings;
    let log_name = &context.config.log_name;

    context
        .state
        .send_replace(State::ShuttingDown(ShutdownState::Stopping));

    let workers = context.active.close();

    if workers.is_empty() {
        info!(listener = %log_name, "No pending connections");
    } else {
        info!(
            listener = %log_name,
            pending = workers.len(),
            "Can't shutdown yet, stopping pending connections"
        );

        context
            .state
            .send_replace(State::ShuttingDown(ShutdownState::Draining(workers.len())));

        let stragglers = join_all(workers, timings.drain_pause, timings.drain_join).await;

        if !stragglers.is_empty() {
            warn!(
                listener = %log_name,
                remaining = stragglers.len(),
                "Some connections did not stop, waiting once more"
            );

            let abandoned =
                join_all(stragglers, timings.drain_pause, timings.drain_force_join).await;

            for worker in &abandoned {
                warn!(
                    listener = %log_name,
                    client = %worker.client_addr(),
                    backend = %worker.backend(),
                    "Abandoning connection"
                );
                worker.abort();
            }
        }
    }

    for mut task in background {
        if tokio::time::timeout(timings.background_join, &mut task)
            .await
            .is_err()
        {
            warn!(listener = %log_name, "Background task did not stop in time");
            task.abort();
        }
    }

    context
        .state
        .send_replace(State::ShuttingDown(ShutdownState::Done));
}

/// Waits `pause` and then joins every worker with `timeout`, returning the
/// ones that are still running.
async fn join_all(workers: Vec<Worker>, pause: Duration, timeout: Duration) -> Vec<Worker> {
    sleep(pause).await;

    let mut running = Vec::new();

    for mut worker in workers {
        if !worker.join(timeout).await {
            running.push(worker);
        }
    }

    running
}
