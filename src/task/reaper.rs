//! Reaper. Removes finished workers from the active set so that it doesn't
//! grow forever.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::debug;

use super::{
    active::ActiveSet,
    server::{wait_until, Context, State},
};

/// Waits [`crate::config::Timings::reaper_grace`] and then reaps finished
/// workers every [`crate::config::Timings::reaper_interval`] until the server
/// starts shutting down.
pub(super) async fn run(context: Arc<Context>) {
    let timings = context.config.timings;
    let mut state = context.subscribe();

    tokio::select! {
        _ = sleep(timings.reaper_grace) => {}
        _ = wait_until(&mut state, State::is_shutting_down) => return,
    }

    loop {
        let reaped = reap(&context.active, timings.reaper_join).await;

        if reaped > 0 {
            debug!(
                listener = %context.config.log_name,
                reaped,
                active = context.active.len(),
                "Reaped finished connections"
            );
        }

        tokio::select! {
            _ = sleep(timings.reaper_interval) => {}
            _ = wait_until(&mut state, State::is_shutting_down) => return,
        }
    }
}

/// Removes every finished worker from `active`, giving each task
/// `join_timeout` to wind down. Workers that are still alive are never
/// touched. Returns how many workers were removed.
pub(super) async fn reap(active: &ActiveSet, join_timeout: Duration) -> usize {
    let mut finished = active.remove_reapable();

    for worker in &mut finished {
        worker.join(join_timeout).await;
    }

    finished.len()
}
