use std::sync::Arc;

use chrono::{Duration, Utc};
use helpdock_core::error::HelpDockError;
use helpdock_core::types::{VisitorInfo, VisitorPresence};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use helpdock_storage::db::{call_blocking, Database};

/// Rooms whose visitor id carries this prefix are live support agents.
pub const AGENT_PREFIX: &str = "agent:";

/// Lightweight change signal; dashboard consumers re-fetch the online list
/// for their chatbot on receipt.
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub chatbot_id: Option<String>,
}

/// Authoritative record of connected visitors, one row per room, backed by
/// sqlite. All mutations go through single-statement upserts so concurrent
/// joins for one room can never race into duplicate rows.
#[derive(Clone)]
pub struct PresenceRegistry {
    db: Arc<Database>,
    changes: broadcast::Sender<PresenceChange>,
    geo: Option<GeoLookup>,
}

#[derive(Clone)]
struct GeoLookup {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    city: Option<String>,
    #[serde(default, rename = "regionName")]
    region_name: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

impl PresenceRegistry {
    pub fn new(db: Arc<Database>, geo_base_url: Option<String>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            db,
            changes,
            geo: geo_base_url.map(|base_url| GeoLookup {
                http: reqwest::Client::new(),
                base_url,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    /// Insert or refresh a presence row. Geolocation enrichment is
    /// best-effort: a failed lookup logs and proceeds with null fields.
    pub async fn join(&self, room: &str, mut info: VisitorInfo) -> Result<(), HelpDockError> {
        if let (Some(geo), Some(ip)) = (&self.geo, info.ip_address.clone()) {
            if info.city.is_none() {
                match geo.lookup(&ip).await {
                    Ok(resolved) => {
                        info.city = resolved.city;
                        info.region = resolved.region_name;
                        info.country = resolved.country;
                        info.lat = resolved.lat;
                        info.long = resolved.lon;
                    }
                    Err(e) => {
                        warn!(target: "presence", room = %room, "Geo lookup failed: {e}");
                    }
                }
            }
        }

        let chatbot_id = info.chatbot_id.clone();
        let room_owned = room.to_string();
        let now = Utc::now().to_rfc3339();
        call_blocking(self.db.clone(), move |db| {
            db.upsert_presence(&room_owned, &info, &now)
        })
        .await?;
        info!(target: "presence", room = %room, chatbot_id = %chatbot_id, "Visitor joined");
        self.publish(Some(chatbot_id));
        Ok(())
    }

    /// Refresh `last_seen`. An unknown room is a benign no-op.
    pub async fn heartbeat(&self, room: &str) -> Result<(), HelpDockError> {
        let room_owned = room.to_string();
        let now = Utc::now().to_rfc3339();
        let known = call_blocking(self.db.clone(), move |db| {
            db.heartbeat_presence(&room_owned, &now)
        })
        .await?;
        if !known {
            info!(target: "presence", room = %room, "Heartbeat for unknown room ignored");
        }
        Ok(())
    }

    pub async fn leave(&self, room: &str) -> Result<(), HelpDockError> {
        let room_owned = room.to_string();
        let known = call_blocking(self.db.clone(), move |db| {
            db.mark_presence_offline(&room_owned)
        })
        .await?;
        if known {
            info!(target: "presence", room = %room, "Visitor left");
            self.publish(None);
        } else {
            info!(target: "presence", room = %room, "Leave for unknown room ignored");
        }
        Ok(())
    }

    /// Flip rows offline whose last heartbeat is older than the threshold.
    pub async fn evict_stale(&self, stale_seconds: u64) -> Result<usize, HelpDockError> {
        let cutoff = (Utc::now() - Duration::seconds(stale_seconds as i64)).to_rfc3339();
        let flipped =
            call_blocking(self.db.clone(), move |db| db.evict_stale_presence(&cutoff)).await?;
        if flipped > 0 {
            info!(target: "presence", flipped, "Stale presence rows marked offline");
            self.publish(None);
        }
        Ok(flipped)
    }

    pub async fn list_online(&self, chatbot_id: &str) -> Result<Vec<VisitorPresence>, HelpDockError> {
        let chatbot_id = chatbot_id.to_string();
        call_blocking(self.db.clone(), move |db| {
            db.list_online_presence(&chatbot_id)
        })
        .await
    }

    /// First online agent room for the chatbot, if any agent is connected.
    pub async fn find_available_agent(
        &self,
        chatbot_id: &str,
    ) -> Result<Option<String>, HelpDockError> {
        let online = self.list_online(chatbot_id).await?;
        Ok(online
            .into_iter()
            .find(|p| p.visitor_id.starts_with(AGENT_PREFIX))
            .map(|p| p.room))
    }

    fn publish(&self, chatbot_id: Option<String>) {
        // Nobody listening is fine.
        let _ = self.changes.send(PresenceChange { chatbot_id });
    }
}

impl GeoLookup {
    async fn lookup(&self, ip: &str) -> Result<GeoResponse, HelpDockError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), ip);
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(HelpDockError::Transport(format!(
                "geo lookup returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.json::<GeoResponse>().await?)
    }
}
