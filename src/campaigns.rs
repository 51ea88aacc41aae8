use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignType {
    Recurring,
    OneTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisitorType {
    All,
    FirstTime,
    Returning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Trigger {
    /// Fires once the visitor has spent at least `seconds` on the page.
    TimeOnPage { seconds: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    MatchAll,
    MatchAny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operator {
    Eq,
    Neq,
    Contains,
    NotContains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSet {
    pub match_type: MatchType,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Targeting {
    pub visitor_type: VisitorType,
    pub trigger: Trigger,
    pub rules: RuleSet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignButton {
    pub label: String,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignContent {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub buttons: Vec<CampaignButton>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    #[serde(rename = "type")]
    pub campaign_type: CampaignType,
    pub status: String,
    #[serde(default)]
    pub content: CampaignContent,
    pub targeting: Targeting,
}

/// Visitor-side state the targeting rules are evaluated against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisitorState {
    pub visitor_id: String,
    #[serde(default)]
    pub is_returning: bool,
    #[serde(default)]
    pub time_on_page_seconds: u64,
    /// Free-form visitor/session attributes (page, plan, referrer, ...).
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub count: i64,
    pub last_view: DateTime<Utc>,
    pub views: Vec<DateTime<Utc>>,
}

/// Repository for per-visitor campaign view history. Keyed by campaign id;
/// the visitor identity is fixed at construction so callers thread it
/// explicitly instead of reading ambient state.
pub trait ViewStore {
    fn get(&self, campaign_id: &str) -> Option<ViewRecord>;
    fn put(&mut self, campaign_id: &str, record: ViewRecord);
    fn delete(&mut self, campaign_id: &str);
}

#[derive(Debug, Default)]
pub struct MemoryViewStore {
    records: HashMap<String, ViewRecord>,
}

impl MemoryViewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ViewStore for MemoryViewStore {
    fn get(&self, campaign_id: &str) -> Option<ViewRecord> {
        self.records.get(campaign_id).cloned()
    }

    fn put(&mut self, campaign_id: &str, record: ViewRecord) {
        self.records.insert(campaign_id.to_string(), record);
    }

    fn delete(&mut self, campaign_id: &str) {
        self.records.remove(campaign_id);
    }
}

/// Server-side view store keyed by an explicit visitor identity. Storage
/// failures degrade to "no record" with a warning, matching the local-store
/// semantics the widget has client-side.
pub struct SqliteViewStore<'a> {
    db: &'a helpdock_storage::db::Database,
    visitor_id: String,
}

impl<'a> SqliteViewStore<'a> {
    pub fn new(db: &'a helpdock_storage::db::Database, visitor_id: &str) -> Self {
        Self {
            db,
            visitor_id: visitor_id.to_string(),
        }
    }
}

impl ViewStore for SqliteViewStore<'_> {
    fn get(&self, campaign_id: &str) -> Option<ViewRecord> {
        let row = match self.db.get_campaign_view(&self.visitor_id, campaign_id) {
            Ok(row) => row?,
            Err(e) => {
                tracing::warn!(target: "campaigns", "View record read failed: {e}");
                return None;
            }
        };
        let parse = |raw: &str| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        };
        Some(ViewRecord {
            count: row.count,
            last_view: parse(&row.last_view)?,
            views: row.views.iter().filter_map(|v| parse(v)).collect(),
        })
    }

    fn put(&mut self, campaign_id: &str, record: ViewRecord) {
        let row = helpdock_storage::db::CampaignViewRow {
            count: record.count,
            last_view: record.last_view.to_rfc3339(),
            views: record.views.iter().map(|v| v.to_rfc3339()).collect(),
        };
        if let Err(e) = self.db.put_campaign_view(&self.visitor_id, campaign_id, &row) {
            tracing::warn!(target: "campaigns", "View record write failed: {e}");
        }
    }

    fn delete(&mut self, campaign_id: &str) {
        if let Err(e) = self.db.delete_campaign_view(&self.visitor_id, campaign_id) {
            tracing::warn!(target: "campaigns", "View record delete failed: {e}");
        }
    }
}

/// Analytics hooks fire independently of the capping decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnalyticsEvent {
    Impression,
    Click,
    Close,
}

pub trait AnalyticsSink: Send + Sync {
    fn track(&self, campaign_id: &str, event: AnalyticsEvent);
}

/// Default sink: structured log lines, picked up by whatever ships logs.
#[derive(Debug, Default, Clone)]
pub struct TracingAnalyticsSink;

impl AnalyticsSink for TracingAnalyticsSink {
    fn track(&self, campaign_id: &str, event: AnalyticsEvent) {
        info!(
            target: "campaigns",
            campaign_id = %campaign_id,
            event = ?event,
            "Campaign analytics event"
        );
    }
}

fn visitor_type_passes(wanted: VisitorType, visitor: &VisitorState) -> bool {
    match wanted {
        VisitorType::All => true,
        VisitorType::FirstTime => !visitor.is_returning,
        VisitorType::Returning => visitor.is_returning,
    }
}

fn trigger_holds(trigger: &Trigger, visitor: &VisitorState) -> bool {
    match trigger {
        Trigger::TimeOnPage { seconds } => visitor.time_on_page_seconds >= *seconds,
    }
}

fn condition_holds(condition: &Condition, visitor: &VisitorState) -> bool {
    let actual = visitor.attributes.get(&condition.field);
    match condition.operator {
        Operator::Eq => actual.map(|v| v == &condition.value).unwrap_or(false),
        Operator::Neq => actual.map(|v| v != &condition.value).unwrap_or(true),
        Operator::Contains => actual
            .map(|v| v.contains(&condition.value))
            .unwrap_or(false),
        Operator::NotContains => actual
            .map(|v| !v.contains(&condition.value))
            .unwrap_or(true),
    }
}

fn rules_pass(rules: &RuleSet, visitor: &VisitorState) -> bool {
    if rules.conditions.is_empty() {
        return true;
    }
    match rules.match_type {
        MatchType::MatchAll => rules.conditions.iter().all(|c| condition_holds(c, visitor)),
        MatchType::MatchAny => rules.conditions.iter().any(|c| condition_holds(c, visitor)),
    }
}

/// Frequency check. Asymmetric on purpose: recurring campaigns never cap
/// and never record; one-time campaigns pass only while no view record
/// exists for this visitor.
fn frequency_passes(campaign: &Campaign, store: &dyn ViewStore) -> bool {
    match campaign.campaign_type {
        CampaignType::Recurring => true,
        CampaignType::OneTime => store.get(&campaign.id).is_none(),
    }
}

/// Pure decision: visitor-type filter, then trigger, then rules, then the
/// frequency cap.
pub fn can_show(campaign: &Campaign, visitor: &VisitorState, store: &dyn ViewStore) -> bool {
    if !visitor_type_passes(campaign.targeting.visitor_type, visitor) {
        return false;
    }
    if !trigger_holds(&campaign.targeting.trigger, visitor) {
        return false;
    }
    if !rules_pass(&campaign.targeting.rules, visitor) {
        return false;
    }
    frequency_passes(campaign, store)
}

/// Record a qualifying impression. No-op for recurring campaigns.
pub fn record_view(
    campaign_id: &str,
    campaign_type: CampaignType,
    store: &mut dyn ViewStore,
    now: DateTime<Utc>,
) {
    if campaign_type == CampaignType::Recurring {
        return;
    }
    let record = match store.get(campaign_id) {
        Some(mut existing) => {
            existing.count += 1;
            existing.last_view = now;
            existing.views.push(now);
            existing
        }
        None => ViewRecord {
            count: 1,
            last_view: now,
            views: vec![now],
        },
    };
    store.put(campaign_id, record);
}
