//! Graceful shutdown: drain in-flight turns, close bridges, persist
//! sessions, remove `daemon.json`, release the HTTP listener.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use tamias_core::paths::DaemonInfo;

use crate::app::AppState;

/// How long to wait for in-flight turns to finish their current step.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn run(state: Arc<AppState>) {
    info!("graceful shutdown starting");

    // 1. Flag the runner: turns finish their current step and terminate
    //    with error{"shutdown"}; queued jobs are discarded below.
    state.shutdown.cancel();

    // 2. Wait for in-flight turns to wind down.
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let in_flight = state
            .store
            .all_handles()
            .iter()
            .filter(|h| h.is_processing())
            .count();
        if in_flight == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(in_flight, "drain timeout reached, continuing shutdown");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // 3. Close bridges (clears typing indicators and reactions state).
    for bridge in state.dispatcher.bridges() {
        bridge.disconnect().await;
    }

    // 4. Discard queued jobs and persist a final snapshot per session.
    for handle in state.store.all_handles() {
        handle.clear_queue();
        if let Err(e) = state.store.persist(&handle) {
            warn!(error = %e, session = %handle.id, "final persist failed");
        }
    }

    DaemonInfo::remove(&state.root);
    info!("shutdown complete");
}
