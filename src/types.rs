use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which fill attribute statistics are grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    /// Builder address credited with routing the fill.
    #[default]
    Builder,
    /// Participant (trading account) address.
    User,
    /// Traded coin, e.g. "BTC".
    Coin,
}

/// Deduplication identifier of an event. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() { None } else { Some(Self(id)) }
    }

    /// Composite `hash:participant:size` identifier. `None` without a hash.
    pub fn composite(hash: &str, participant: &str, size: &str) -> Option<Self> {
        if hash.is_empty() {
            return None;
        }
        Self::new(format!("{hash}:{participant}:{size}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liquidation details carried on a fill.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationInfo {
    pub liquidated_user: Option<String>,
    pub mark_px: Option<String>,
    pub method: Option<String>,
}

/// A single decoded fill (or liquidation) from the stream.
///
/// Numeric fields keep the wire text; they are parsed when the event is
/// folded into the running statistics so a bad number only zeroes that field.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    /// Grouping key (builder address, account address or coin).
    pub key: String,
    /// Lowercased participant address, empty if the payload had none.
    pub participant: String,
    pub coin: Option<String>,
    pub side: Option<String>,
    pub price: Option<String>,
    pub size: Option<String>,
    pub fee: Option<String>,
    pub fee_token: Option<String>,
    pub closed_pnl: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub block_number: Option<u64>,
    pub liquidation: Option<LiquidationInfo>,
}

impl Event {
    pub fn is_liquidation(&self) -> bool {
        self.liquidation.is_some()
    }
}

/// Display metadata for a builder address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderInfo {
    pub name: String,
    #[serde(default = "default_builder_color")]
    pub color: String,
    #[serde(default)]
    pub logo: String,
}

fn default_builder_color() -> String {
    "#6B7280".to_string()
}

impl Default for BuilderInfo {
    /// The catch-all "Other" category.
    fn default() -> Self {
        Self {
            name: "Other".to_string(),
            color: "#4B5563".to_string(),
            logo: String::new(),
        }
    }
}

/// Point-in-time view of one key's running statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStats {
    pub address: String,
    pub name: String,
    pub color: String,
    pub logo: String,
    pub is_known: bool,
    pub trade_count: u64,
    pub total_volume_usd: Decimal,
    pub total_fees_usd: Decimal,
    /// Fees in unrecognized currencies, excluded from USD totals.
    pub non_usd_fees: BTreeMap<String, Decimal>,
    pub realized_pnl: Decimal,
    pub unique_users: usize,
    pub liquidation_count: u64,
    pub liquidation_volume_usd: Decimal,
    pub last_active: Option<DateTime<Utc>>,
}

/// Totals derived from every key's statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalTotals {
    pub volume: Decimal,
    pub fees: Decimal,
    pub trades: u64,
    pub liquidations: u64,
    /// Distinct participants across all keys.
    pub users: usize,
    pub avg_revenue_per_user: Decimal,
}

/// One row of the chart view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartRow {
    pub name: String,
    pub color: String,
    pub logo: String,
    pub volume: Decimal,
    pub trades: u64,
    pub fees: Decimal,
    pub users: usize,
}

/// Known builders individually, everything else folded into "Other".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub builders: Vec<ChartRow>,
    pub totals: GlobalTotals,
    pub started_at: DateTime<Utc>,
}

/// Recently accepted event, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
    pub id: EventId,
    pub key: String,
    pub participant: String,
    pub coin: Option<String>,
    pub side: Option<String>,
    pub price: Decimal,
    pub size: Decimal,
    pub volume_usd: Decimal,
    pub fee: Decimal,
    pub fee_token: Option<String>,
    pub closed_pnl: Decimal,
    pub liquidation: Option<LiquidationInfo>,
    pub timestamp: DateTime<Utc>,
    pub block_number: Option<u64>,
}

/// Ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub accepted: u64,
    pub duplicates: u64,
    pub parse_warnings: u64,
}

/// Immutable copy of the aggregate state, safe to hand to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Per-key statistics, highest USD fees first.
    #[serde(rename = "data")]
    pub entries: Vec<KeyStats>,
    pub totals: GlobalTotals,
    #[serde(rename = "chartData")]
    pub chart: ChartData,
    /// Newest first.
    pub recent: Vec<RecentEvent>,
    pub counters: Counters,
    /// Highest block number seen so far.
    pub block_number: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn get(&self, key: &str) -> Option<&KeyStats> {
        self.entries.iter().find(|s| s.address == key)
    }
}

/// Result of folding one event into the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// New event; carries the key's updated statistics.
    Accepted(Box<KeyStats>),
    /// Identifier already seen; nothing changed.
    Duplicate,
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    InitialStats,
    StatsUpdate,
}

/// Message delivered to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdate {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Increases by one per published update.
    pub sequence: u64,
    #[serde(flatten)]
    pub snapshot: Arc<Snapshot>,
}

impl StatsUpdate {
    /// Source block number of the snapshot, for gap detection.
    pub fn block_number(&self) -> Option<u64> {
        self.snapshot.block_number
    }
}
