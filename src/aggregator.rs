//! Running per-key statistics over the fill stream.
//!
//! The [`Aggregator`] is the only owner of the key → stats mapping and of the
//! deduplication window. Readers only ever get a [`Snapshot`], a full copy
//! built while no update is in progress.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::AggregatorConfig;
use crate::decode::parse_decimal;
use crate::types::{
    BuilderInfo, ChartData, ChartRow, Counters, Event, EventId, GlobalTotals, IngestOutcome,
    KeyStats, RecentEvent, Snapshot,
};

/// Fee currencies always treated as USD.
const USD_STABLECOINS: &[&str] = &["USDC", "USDH"];

/// Bucket for non-zero fees that arrive without a currency code.
const UNKNOWN_CURRENCY: &str = "UNKNOWN";

/// Decimal places kept for average revenue per user.
const AVG_REVENUE_DP: u32 = 6;

/// Whether a fee currency counts toward USD revenue.
pub fn is_usd_stablecoin(code: &str) -> bool {
    USD_STABLECOINS.contains(&code) || code.starts_with("USD")
}

/// Display metadata lookup for builder addresses.
#[derive(Debug, Clone, Default)]
pub struct BuilderDirectory {
    known: HashMap<String, BuilderInfo>,
    other: BuilderInfo,
}

impl BuilderDirectory {
    /// `known` addresses must already be lowercase.
    pub fn new(known: impl IntoIterator<Item = (String, BuilderInfo)>, other: BuilderInfo) -> Self {
        Self {
            known: known.into_iter().collect(),
            other,
        }
    }

    pub fn lookup(&self, address: &str) -> Option<&BuilderInfo> {
        self.known.get(address)
    }

    pub fn other(&self) -> &BuilderInfo {
        &self.other
    }

    fn resolve(&self, address: &str) -> KeyMeta {
        match self.lookup(address) {
            Some(info) => KeyMeta {
                info: info.clone(),
                is_known: true,
            },
            None => KeyMeta {
                info: BuilderInfo {
                    name: truncate_address(address),
                    color: self.other.color.clone(),
                    logo: self.other.logo.clone(),
                },
                is_known: false,
            },
        }
    }
}

/// `0x1234...5678` for long addresses, unchanged otherwise.
fn truncate_address(address: &str) -> String {
    if address.len() > 10 && address.is_ascii() {
        format!("{}...{}", &address[..6], &address[address.len() - 4..])
    } else {
        address.to_string()
    }
}

#[derive(Debug, Clone)]
struct KeyMeta {
    info: BuilderInfo,
    is_known: bool,
}

/// Identifiers of recently accepted events, evicted oldest first.
#[derive(Debug)]
struct RecentIds {
    capacity: usize,
    order: VecDeque<EventId>,
    seen: HashSet<EventId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: EventId) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Per-key sums that are cheap to copy.
#[derive(Debug, Clone, Copy, Default)]
struct Figures {
    trade_count: u64,
    volume: Decimal,
    fees_usd: Decimal,
    realized_pnl: Decimal,
    liquidation_count: u64,
    liquidation_volume: Decimal,
    last_active: Option<DateTime<Utc>>,
}

/// Accumulated state for one key.
#[derive(Debug)]
struct RunningStats {
    meta: Arc<KeyMeta>,
    figures: Figures,
    non_usd_fees: BTreeMap<String, Decimal>,
    users: HashSet<Arc<str>>,
}

impl RunningStats {
    fn new(meta: KeyMeta) -> Self {
        Self {
            meta: Arc::new(meta),
            figures: Figures::default(),
            non_usd_fees: BTreeMap::new(),
            users: HashSet::new(),
        }
    }

    fn tally(&self, address: &str) -> KeyTally {
        KeyTally {
            address: address.to_string(),
            meta: Arc::clone(&self.meta),
            figures: self.figures,
            non_usd_fees: self.non_usd_fees.clone(),
            unique_users: self.users.len(),
        }
    }
}

/// One key's figures as copied out of the aggregator.
#[derive(Debug, Clone)]
struct KeyTally {
    address: String,
    meta: Arc<KeyMeta>,
    figures: Figures,
    non_usd_fees: BTreeMap<String, Decimal>,
    unique_users: usize,
}

impl KeyTally {
    fn view(&self) -> KeyStats {
        let f = &self.figures;
        KeyStats {
            address: self.address.clone(),
            name: self.meta.info.name.clone(),
            color: self.meta.info.color.clone(),
            logo: self.meta.info.logo.clone(),
            is_known: self.meta.is_known,
            trade_count: f.trade_count,
            total_volume_usd: f.volume,
            total_fees_usd: f.fees_usd,
            non_usd_fees: self.non_usd_fees.clone(),
            realized_pnl: f.realized_pnl,
            unique_users: self.unique_users,
            liquidation_count: f.liquidation_count,
            liquidation_volume_usd: f.liquidation_volume,
            last_active: f.last_active,
        }
    }
}

/// Saturating add for running sums.
fn accumulate(total: &mut Decimal, amount: Decimal) {
    *total = total.saturating_add(amount);
}

/// Raw aggregate figures, copied in time linear in the number of keys.
///
/// Sorting, totals and chart rows are derived by [`Tally::into_snapshot`],
/// which needs no access to the aggregator.
#[derive(Debug, Clone)]
pub struct Tally {
    keys: Vec<KeyTally>,
    users: usize,
    other_users: usize,
    other: BuilderInfo,
    recent: Vec<RecentEvent>,
    counters: Counters,
    block_number: Option<u64>,
    started_at: DateTime<Utc>,
}

impl Tally {
    pub fn into_snapshot(self) -> Snapshot {
        let mut entries: Vec<KeyStats> = self.keys.iter().map(KeyTally::view).collect();
        entries.sort_by(|a, b| {
            b.total_fees_usd
                .cmp(&a.total_fees_usd)
                .then_with(|| b.total_volume_usd.cmp(&a.total_volume_usd))
                .then_with(|| a.address.cmp(&b.address))
        });

        let totals = self.totals();
        let chart = self.chart_data(totals.clone());
        Snapshot {
            entries,
            chart,
            totals,
            recent: self.recent,
            counters: self.counters,
            block_number: self.block_number,
            started_at: self.started_at,
        }
    }

    /// Totals across every key.
    pub fn totals(&self) -> GlobalTotals {
        let mut totals = GlobalTotals::default();
        for key in &self.keys {
            accumulate(&mut totals.volume, key.figures.volume);
            accumulate(&mut totals.fees, key.figures.fees_usd);
            totals.trades += key.figures.trade_count;
            totals.liquidations += key.figures.liquidation_count;
        }
        totals.users = self.users;
        if totals.users > 0 {
            totals.avg_revenue_per_user =
                (totals.fees / Decimal::from(totals.users)).round_dp(AVG_REVENUE_DP);
        }
        totals
    }

    /// Known keys individually (highest fees first), unknown keys folded into one row.
    fn chart_data(&self, totals: GlobalTotals) -> ChartData {
        let mut rows = Vec::new();
        let mut other_volume = Decimal::ZERO;
        let mut other_fees = Decimal::ZERO;
        let mut other_trades = 0u64;

        for key in &self.keys {
            let f = &key.figures;
            if key.meta.is_known {
                rows.push(ChartRow {
                    name: key.meta.info.name.clone(),
                    color: key.meta.info.color.clone(),
                    logo: key.meta.info.logo.clone(),
                    volume: f.volume,
                    trades: f.trade_count,
                    fees: f.fees_usd,
                    users: key.unique_users,
                });
            } else {
                accumulate(&mut other_volume, f.volume);
                accumulate(&mut other_fees, f.fees_usd);
                other_trades += f.trade_count;
            }
        }

        rows.sort_by(|a, b| b.fees.cmp(&a.fees).then_with(|| a.name.cmp(&b.name)));

        if other_trades > 0 {
            rows.push(ChartRow {
                name: self.other.name.clone(),
                color: self.other.color.clone(),
                logo: self.other.logo.clone(),
                volume: other_volume,
                trades: other_trades,
                fees: other_fees,
                users: self.other_users,
            });
        }

        ChartData {
            builders: rows,
            totals,
            started_at: self.started_at,
        }
    }
}

/// Folds events into per-key running statistics.
#[derive(Debug)]
pub struct Aggregator {
    stats: HashMap<String, RunningStats>,
    /// Every participant seen under any key. Grows with the per-key sets.
    users: HashSet<Arc<str>>,
    /// Participants seen under keys without directory metadata.
    other_users: HashSet<Arc<str>>,
    recent_ids: RecentIds,
    recent: VecDeque<RecentEvent>,
    recent_capacity: usize,
    builders: BuilderDirectory,
    counters: Counters,
    latest_block: Option<u64>,
    started_at: DateTime<Utc>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(&AggregatorConfig::default(), BuilderDirectory::default())
    }
}

impl Aggregator {
    pub fn new(config: &AggregatorConfig, builders: BuilderDirectory) -> Self {
        Self {
            stats: HashMap::new(),
            users: HashSet::new(),
            other_users: HashSet::new(),
            recent_ids: RecentIds::new(config.dedup_capacity),
            recent: VecDeque::with_capacity(config.recent_capacity),
            recent_capacity: config.recent_capacity,
            builders,
            counters: Counters::default(),
            latest_block: None,
            started_at: Utc::now(),
        }
    }

    /// Fold one event into the statistics.
    ///
    /// An identifier already in the dedup window yields `Duplicate` and changes
    /// nothing. Numeric fields that do not parse count as zero for this event.
    pub fn ingest(&mut self, event: Event) -> IngestOutcome {
        if self.recent_ids.contains(&event.id) {
            self.counters.duplicates += 1;
            debug!(id = %event.id, "duplicate event");
            return IngestOutcome::Duplicate;
        }

        let price = self.numeric("px", event.price.as_deref(), &event.id);
        let size = self.numeric("sz", event.size.as_deref(), &event.id);
        let fee = self.numeric("fee", event.fee.as_deref(), &event.id);
        let pnl = self.numeric("closedPnl", event.closed_pnl.as_deref(), &event.id);
        let volume = match price.checked_mul(size) {
            Some(v) => v,
            None => {
                self.counters.parse_warnings += 1;
                warn!(id = %event.id, "volume overflow ({price} x {size}), counting as zero");
                Decimal::ZERO
            }
        };
        let timestamp = event.timestamp.unwrap_or_else(Utc::now);

        self.recent_ids.insert(event.id.clone());
        self.counters.accepted += 1;
        if let Some(block) = event.block_number {
            self.latest_block = Some(self.latest_block.map_or(block, |b| b.max(block)));
        }

        let builders = &self.builders;
        let entry = self
            .stats
            .entry(event.key.clone())
            .or_insert_with(|| RunningStats::new(builders.resolve(&event.key)));

        let f = &mut entry.figures;
        f.trade_count += 1;
        accumulate(&mut f.volume, volume);
        accumulate(&mut f.realized_pnl, pnl);
        match event.fee_token.as_deref() {
            Some(code) if is_usd_stablecoin(code) => accumulate(&mut f.fees_usd, fee),
            other if !fee.is_zero() => {
                let code = other.unwrap_or(UNKNOWN_CURRENCY);
                warn!(
                    "Excluding non-USD fee from totals: {fee} {code} (key={})",
                    truncate_address(&event.key)
                );
                accumulate(entry.non_usd_fees.entry(code.to_string()).or_default(), fee);
            }
            _ => {}
        }
        if event.is_liquidation() {
            f.liquidation_count += 1;
            accumulate(&mut f.liquidation_volume, volume);
        }
        f.last_active = Some(timestamp);

        if !event.participant.is_empty() {
            let user = match self.users.get(event.participant.as_str()) {
                Some(user) => Arc::clone(user),
                None => {
                    let user: Arc<str> = Arc::from(event.participant.as_str());
                    self.users.insert(Arc::clone(&user));
                    user
                }
            };
            if !entry.meta.is_known {
                self.other_users.insert(Arc::clone(&user));
            }
            entry.users.insert(user);
        }

        let updated = entry.tally(&event.key).view();

        if self.recent_capacity > 0 {
            self.recent.push_front(RecentEvent {
                id: event.id,
                key: event.key,
                participant: event.participant,
                coin: event.coin,
                side: event.side,
                price,
                size,
                volume_usd: volume,
                fee,
                fee_token: event.fee_token,
                closed_pnl: pnl,
                liquidation: event.liquidation,
                timestamp,
                block_number: event.block_number,
            });
            self.recent.truncate(self.recent_capacity);
        }

        IngestOutcome::Accepted(Box::new(updated))
    }

    fn numeric(&mut self, field: &'static str, raw: Option<&str>, id: &EventId) -> Decimal {
        parse_decimal(field, raw).unwrap_or_else(|warning| {
            self.counters.parse_warnings += 1;
            warn!(%id, "{warning}, counting as zero");
            Decimal::ZERO
        })
    }

    /// Copy of the raw figures, enough to build a [`Snapshot`] without the aggregator.
    pub fn tally(&self) -> Tally {
        Tally {
            keys: self
                .stats
                .iter()
                .map(|(address, stats)| stats.tally(address))
                .collect(),
            users: self.users.len(),
            other_users: self.other_users.len(),
            other: self.builders.other().clone(),
            recent: self.recent.iter().cloned().collect(),
            counters: self.counters,
            block_number: self.latest_block,
            started_at: self.started_at,
        }
    }

    /// Full copy of the current statistics.
    pub fn snapshot(&self) -> Snapshot {
        self.tally().into_snapshot()
    }

    pub fn global_totals(&self) -> GlobalTotals {
        self.tally().totals()
    }

    /// Highest block number seen so far.
    pub fn latest_block(&self) -> Option<u64> {
        self.latest_block
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Most recently accepted event, if history is kept.
    pub fn last_accepted(&self) -> Option<&RecentEvent> {
        self.recent.front()
    }
}

/// Aggregator shared between the ingest pipeline and readers.
///
/// The lock is held for one event update or one [`Tally`] copy, never across
/// an await point. Snapshots are assembled after it is released.
#[derive(Debug, Clone)]
pub struct SharedAggregator(Arc<Mutex<Aggregator>>);

impl SharedAggregator {
    pub fn new(aggregator: Aggregator) -> Self {
        Self(Arc::new(Mutex::new(aggregator)))
    }

    pub fn ingest(&self, event: Event) -> IngestOutcome {
        self.lock().ingest(event)
    }

    pub fn snapshot(&self) -> Snapshot {
        let tally = self.lock().tally();
        tally.into_snapshot()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters()
    }

    fn lock(&self) -> MutexGuard<'_, Aggregator> {
        // `ingest` parses every field before its first write.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
