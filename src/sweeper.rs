use std::sync::Arc;

use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info};

use crate::runtime::AppState;
use helpdock_storage::db::call_blocking;

/// Periodic sweep: idle conversations close and stale presence rows flip
/// offline. A 1-second poll, not an event-driven timer; slight imprecision
/// is fine at the configured granularity.
pub fn spawn_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        info!(target: "sweeper", "Sweeper started");
        let mut ticker =
            tokio::time::interval(Duration::from_secs(state.config.sweep_interval_seconds));
        // If processing falls behind, skip missed ticks instead of burst
        // catch-up runs.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            run_sweep(&state).await;
        }
    });
}

pub(crate) async fn run_sweep(state: &Arc<AppState>) {
    for closed in state.sessions.sweep_idle(Utc::now()).await {
        let closed_at = Utc::now().to_rfc3339();
        let result = call_blocking(state.db.clone(), move |db| {
            db.store_closed_conversation(
                &closed.conversation_id,
                &closed.visitor_id,
                &closed.chatbot_id,
                closed.close_reason.as_str(),
                &closed_at,
                &closed.history,
            )
        })
        .await;
        if let Err(e) = result {
            error!(target: "sweeper", "Failed to persist idle-closed conversation: {e}");
        }
    }

    if let Err(e) = state
        .presence
        .evict_stale(state.config.presence_stale_seconds)
        .await
    {
        error!(target: "sweeper", "Stale presence sweep failed: {e}");
    }
}
