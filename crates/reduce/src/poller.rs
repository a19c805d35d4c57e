//! Completion-event poller.
//!
//! Pages through the coordinator's completion events and turns them into
//! schedulable locations, obsolete marks and tip-failed copies.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::ShuffleContext;
use crate::coordinator::{CompletionEvent, CompletionStatus, ShuffleCoordinator};
use crate::fetcher::stopped;

/// Largest batch requested per poll.
pub const MAX_EVENTS_TO_FETCH: usize = 10_000;

pub(crate) async fn run_poller(
    ctx: Arc<ShuffleContext>,
    coordinator: Arc<dyn ShuffleCoordinator>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut from = 0_usize;
    loop {
        match coordinator
            .poll_completion_events(from, MAX_EVENTS_TO_FETCH)
            .await
        {
            Ok(update) => {
                if update.reset {
                    info!(from, "completion events reset; forgetting known locations");
                    from = 0;
                    ctx.state.lock().await.reset();
                }
                from += update.events.len();
                if !update.events.is_empty() {
                    let changed = apply_events(&ctx, update.events).await;
                    debug!(from, changed, "applied completion events");
                    if changed > 0 {
                        ctx.locations_added.notify_one();
                    }
                }
            }
            Err(e) => {
                ctx.fault.set(e);
                return;
            }
        }

        tokio::select! {
            () = stopped(&mut shutdown) => return,
            () = tokio::time::sleep(ctx.cfg.poll_interval) => {}
        }
    }
}

/// Apply one batch under the shuffle-state lock. Returns how many events
/// can change what the scheduler does next.
async fn apply_events(ctx: &ShuffleContext, events: Vec<CompletionEvent>) -> usize {
    let mut changed = 0;
    let mut state = ctx.state.lock().await;
    for event in events {
        match event.status {
            CompletionStatus::Succeeded => {
                ctx.observe_runtime(event.runtime);
                if !state.is_copied(event.attempt.task) {
                    state.add_location(event.location());
                    changed += 1;
                }
            }
            CompletionStatus::Failed | CompletionStatus::Killed | CompletionStatus::Obsolete => {
                debug!(attempt = %event.attempt, status = ?event.status, "producer attempt obsolete");
                state.mark_obsolete(event.attempt);
            }
            CompletionStatus::TipFailed => {
                info!(task_id = %event.attempt.task, "producer task failed permanently; ignoring its output");
                if state.mark_copied(event.attempt.task) {
                    changed += 1;
                }
            }
        }
    }
    let remaining = ctx.cfg.total_producers.saturating_sub(state.copied_count());
    drop(state);
    ctx.memory.set_num_required(remaining);
    changed
}
