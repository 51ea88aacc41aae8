use chrono::Utc;

use super::*;
use crate::campaigns::{
    can_show, record_view, AnalyticsEvent, Campaign, SqliteViewStore, VisitorState,
};
use helpdock_core::error::HelpDockError;
use helpdock_storage::db::call_blocking;

#[derive(Debug, Deserialize)]
pub(super) struct DecideRequest {
    campaign_id: String,
    visitor: VisitorState,
}

#[derive(Debug, Deserialize)]
pub(super) struct CampaignEventRequest {
    campaign_id: String,
    event: AnalyticsEvent,
}

/// Create or replace a campaign definition. Dashboard-only, so token-guarded.
pub(super) async fn api_put_campaign(
    State(state): State<WebState>,
    headers: HeaderMap,
    Json(campaign): Json<Campaign>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    super::require_token(&state, super::auth_token_from_headers(&headers))?;
    let campaign_id = campaign.id.clone();
    let definition = serde_json::to_string(&campaign)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let now = Utc::now().to_rfc3339();
    let stored_id = campaign_id.clone();
    call_blocking(state.app_state.db.clone(), move |db| {
        db.upsert_campaign(&stored_id, &definition, &now)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    info!(target: "web", campaign_id = %campaign_id, "Campaign stored");
    Ok(Json(json!({ "ok": true, "campaign_id": campaign_id })))
}

pub(super) async fn api_list_campaigns(
    State(state): State<WebState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    super::require_token(&state, super::auth_token_from_headers(&headers))?;
    let definitions = call_blocking(state.app_state.db.clone(), |db| db.list_campaigns())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let mut campaigns = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let parsed: serde_json::Value = serde_json::from_str(&definition)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        campaigns.push(parsed);
    }
    Ok(Json(json!({ "campaigns": campaigns })))
}

/// Targeting and frequency-cap decision for one visitor. A positive decision
/// records the view (one-time campaigns only) and fires the impression hook.
pub(super) async fn api_campaign_decide(
    State(state): State<WebState>,
    Json(req): Json<DecideRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let app = state.app_state.clone();
    let campaign_id = req.campaign_id.clone();
    let decision = call_blocking(app.db.clone(), move |db| {
        let Some(definition) = db.get_campaign(&req.campaign_id)? else {
            return Err(HelpDockError::NotFound(format!(
                "campaign {}",
                req.campaign_id
            )));
        };
        let campaign: Campaign = serde_json::from_str(&definition)?;
        let mut store = SqliteViewStore::new(db, &req.visitor.visitor_id);
        let show = can_show(&campaign, &req.visitor, &store);
        if show {
            record_view(&campaign.id, campaign.campaign_type, &mut store, Utc::now());
        }
        Ok((show, campaign))
    })
    .await
    .map_err(|e| match e {
        HelpDockError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })?;

    let (show, campaign) = decision;
    if show {
        app.analytics.track(&campaign_id, AnalyticsEvent::Impression);
        return Ok(Json(json!({ "ok": true, "show": true, "campaign": campaign })));
    }
    Ok(Json(json!({ "ok": true, "show": false })))
}

/// Widget-reported interaction events. These fire regardless of what the
/// capping decision said.
pub(super) async fn api_campaign_event(
    State(state): State<WebState>,
    Json(req): Json<CampaignEventRequest>,
) -> Json<serde_json::Value> {
    state.app_state.analytics.track(&req.campaign_id, req.event);
    Json(json!({ "ok": true }))
}
