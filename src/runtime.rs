use std::sync::Arc;

use tracing::info;

use crate::assistant::AssistantClient;
use crate::campaigns::{AnalyticsSink, TracingAnalyticsSink};
use crate::config::Config;
use crate::presence::PresenceRegistry;
use crate::session::SessionHub;
use helpdock_storage::db::Database;

pub struct AppState {
    pub config: Config,
    pub db: Arc<Database>,
    pub sessions: SessionHub,
    pub presence: PresenceRegistry,
    pub assistant: AssistantClient,
    pub analytics: Arc<dyn AnalyticsSink>,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Arc<Self> {
        let db = Arc::new(db);
        let geo_base_url = config
            .geo_lookup_enabled
            .then(|| config.geo_base_url.clone());
        Arc::new(AppState {
            sessions: SessionHub::new(config.idle_timeout_seconds),
            presence: PresenceRegistry::new(db.clone(), geo_base_url),
            assistant: AssistantClient::new(&config),
            analytics: Arc::new(TracingAnalyticsSink),
            config,
            db,
        })
    }
}

pub async fn run(config: Config, db: Database) -> anyhow::Result<()> {
    let state = AppState::new(config, db);

    crate::sweeper::spawn_sweeper(state.clone());

    let web_state = state.clone();
    info!(
        "Starting HelpDock server on {}:{}",
        state.config.web_host, state.config.web_port
    );
    tokio::spawn(async move {
        crate::web::start_web_server(web_state).await;
    });

    info!("Runtime active; waiting for Ctrl-C");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl-C: {e}"))?;
    Ok(())
}
