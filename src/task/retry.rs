//! Retry coordinator. Workers that can't reach their backend leave the client
//! connection behind and raise a flag; this task finds them and gives the
//! connection to a new worker with a different backend. The client never
//! notices, apart from some extra latency.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{info, warn};

use super::{
    server::{wait_until, Context, State},
    worker::Failure,
};

/// Scans the active set until the server starts shutting down. Scans are
/// frequent while failures keep showing up and slow down after
/// [`crate::config::Timings::retry_idle_after`] clean scans. A worker that
/// fails wakes this task up immediately, unless the previous scan found
/// failures as well, in which case the fast interval is respected so that a
/// backend refusing everything doesn't turn into a busy loop.
pub(super) async fn run(context: Arc<Context>) {
    let timings = context.config.timings;
    let mut state = context.subscribe();
    let mut clean_scans: u32 = 0;

    loop {
        if resubmit_failures(&context) > 0 {
            clean_scans = 0;

            tokio::select! {
                _ = sleep(timings.retry_interval) => {}
                _ = wait_until(&mut state, State::is_shutting_down) => return,
            }

            continue;
        }

        clean_scans = clean_scans.saturating_add(1);

        let interval = if clean_scans >= timings.retry_idle_after {
            timings.retry_idle_interval
        } else {
            timings.retry_interval
        };

        tokio::select! {
            _ = sleep(interval) => {}
            _ = context.failures.notified() => {}
            _ = wait_until(&mut state, State::is_shutting_down) => return,
        }
    }
}

/// One scan of the active set. Every failure found is re-dispatched to a
/// backend other than the one that failed, chosen at random. Returns the
/// number of connections re-dispatched.
pub(super) fn resubmit_failures(context: &Arc<Context>) -> usize {
    let failures = context.active.take_failures();
    let count = failures.len();

    for Failure {
        client,
        client_addr,
        backend: failed,
    } in failures
    {
        let backend = context.policy.replacement_for(&failed).clone();

        if backend.same_server(&failed) {
            warn!(
                listener = %context.config.log_name,
                client = %client_addr,
                %backend,
                "No other backend available, retrying the same one"
            );
        } else {
            info!(
                listener = %context.config.log_name,
                client = %client_addr,
                %failed,
                %backend,
                "Retrying connection on another backend"
            );
        }

        context.dispatch(client, client_addr, backend);
    }

    count
}
