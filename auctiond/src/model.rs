//! Persisted data model.
//!
//! Everything here serializes into the single JSON snapshot
//! (`users`, `days`, `bid_log`, `policy`, `gpu_usage_tracking`, `config`).
//! Field names follow the wire contract; a few carry legacy aliases so old
//! snapshots load unchanged.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Size of the GPU pool; every slot has exactly this many entries.
pub const GPU_COUNT: u32 = 8;

/// Number of consecutive open days kept ahead of the executing day.
pub const OPEN_DAY_WINDOW: usize = 6;

/// Global bid log retains the most recent records only.
pub const BID_LOG_CAPACITY: usize = 500;

/// Upper bound on day advancements per `update_system_state` call; bounds
/// catch-up work after downtime.
pub const MAX_ADVANCE_PER_CALL: u32 = 10;

/// Sample histograms older than this many days are pruned.
pub const SAMPLE_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    Future,
    Open,
    Executing,
    Final,
}

impl fmt::Display for DayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DayStatus::Future => "future",
            DayStatus::Open => "open",
            DayStatus::Executing => "executing",
            DayStatus::Final => "final",
        };
        f.write_str(s)
    }
}

impl FromStr for DayStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "future" => Ok(DayStatus::Future),
            "open" => Ok(DayStatus::Open),
            "executing" => Ok(DayStatus::Executing),
            "final" => Ok(DayStatus::Final),
            other => Err(format!("unknown day status {other:?}")),
        }
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_salt: String,
    pub password_hash: String,
    pub role: Role,
    /// Credits granted at every day rollover. The wire name predates the
    /// daily cycle; semantics are per-day.
    #[serde(alias = "weekly_budget")]
    pub daily_budget: u64,
    /// Non-negative. Stored as a real so 50% refunds keep their half-credit.
    pub balance: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    /// Slot triples ("day|slot|gpu") where this user was displaced.
    /// Unique, insertion-ordered; consumed by dismiss-by-day.
    #[serde(rename = "outbid_notification_queue", default)]
    pub outbid_notifications: Vec<String>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Public balance figure; internal storage keeps the fraction.
    pub fn balance_floor(&self) -> u64 {
        self.balance.max(0.0).floor() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidEntry {
    pub username: String,
    pub price: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuEntry {
    pub gpu: u32,
    pub price: u64,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub bids: Vec<BidEntry>,
    /// Post-hoc attribution from monitoring samples; written at most once,
    /// after the hour has fully elapsed.
    #[serde(default)]
    pub actual_user: Option<String>,
}

impl GpuEntry {
    pub fn new(gpu: u32) -> Self {
        Self {
            gpu,
            ..Self::default()
        }
    }

    pub fn is_won_by(&self, username: &str) -> bool {
        self.winner.as_deref() == Some(username)
    }

    /// Reset to the unowned state (release, undo-to-empty).
    pub fn clear(&mut self) {
        self.price = 0;
        self.winner = None;
        self.bids.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub gpu_prices: Vec<GpuEntry>,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            gpu_prices: (0..GPU_COUNT).map(GpuEntry::new).collect(),
        }
    }

    pub fn entry(&self, gpu: u32) -> Option<&GpuEntry> {
        self.gpu_prices.get(gpu as usize)
    }

    pub fn entry_mut(&mut self, gpu: u32) -> Option<&mut GpuEntry> {
        self.gpu_prices.get_mut(gpu as usize)
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Day {
    /// Equal to the day's map key (`YYYY-MM-DD`).
    #[serde(alias = "week_start")]
    pub day_start: String,
    pub status: DayStatus,
    #[serde(default)]
    pub finalized_at: Option<DateTime<Utc>>,
    pub slots: BTreeMap<String, Slot>,
}

impl Day {
    pub fn entry(&self, slot_key: &str, gpu: u32) -> Option<&GpuEntry> {
        self.slots.get(slot_key).and_then(|s| s.entry(gpu))
    }

    pub fn entry_mut(&mut self, slot_key: &str, gpu: u32) -> Option<&mut GpuEntry> {
        self.slots.get_mut(slot_key).and_then(|s| s.entry_mut(gpu))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidRecord {
    pub username: String,
    pub day: String,
    pub slot: String,
    pub gpu: u32,
    pub price: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Accepted and stored, never enforced in bid admission. Reserved.
    #[serde(default)]
    pub hourly_gpu_cap: Option<u32>,
    /// day-key -> set of "slot-key_gpuK" forbidden to bidders.
    #[serde(default)]
    pub reserved_slots: BTreeMap<String, BTreeSet<String>>,
}

impl Policy {
    pub fn is_reserved(&self, day: &str, slot: &str, gpu: u32) -> bool {
        self.reserved_slots
            .get(day)
            .is_some_and(|set| set.contains(&reserved_key(slot, gpu)))
    }
}

pub fn reserved_key(slot: &str, gpu: u32) -> String {
    format!("{slot}_gpu{gpu}")
}

/// One auction target. The derived ordering, (day, slot, gpu)
/// lexicographic, is the canonical lock-acquisition order for every
/// multi-slot operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub day: String,
    pub slot: String,
    pub gpu: u32,
}

impl SlotRef {
    pub fn new(day: impl Into<String>, slot: impl Into<String>, gpu: u32) -> Self {
        Self {
            day: day.into(),
            slot: slot.into(),
            gpu,
        }
    }

    /// Opaque triple queued for outbid users.
    pub fn notification_key(&self) -> String {
        format!("{}|{}|{}", self.day, self.slot, self.gpu)
    }
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/gpu{}", self.day, self.slot, self.gpu)
    }
}

/// Per-hour usage histogram: day -> slot -> gpu -> (username -> poll count).
/// The innermost map is insertion-ordered; argmax ties resolve to the user
/// seen first.
pub type UsageTracking = BTreeMap<String, BTreeMap<String, BTreeMap<u32, IndexMap<String, u64>>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Local hour [0,23] at which logical days begin.
    #[serde(default)]
    pub transition_hour: u8,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { transition_hour: 0 }
    }
}

/// The whole authoritative state; one JSON document on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub days: BTreeMap<String, Day>,
    #[serde(default)]
    pub bid_log: VecDeque<BidRecord>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub gpu_usage_tracking: UsageTracking,
    #[serde(default)]
    pub config: StateConfig,
}

impl State {
    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn user_mut(&mut self, username: &str) -> Option<&mut User> {
        self.users.get_mut(username)
    }

    pub fn executing_day_key(&self) -> Option<&str> {
        self.days
            .iter()
            .find(|(_, d)| d.status == DayStatus::Executing)
            .map(|(k, _)| k.as_str())
    }

    /// Keys of all open days, ascending.
    pub fn open_day_keys(&self) -> Vec<&str> {
        self.days
            .iter()
            .filter(|(_, d)| d.status == DayStatus::Open)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Append to the global bid log, keeping only the newest records.
    pub fn push_bid_record(&mut self, record: BidRecord) {
        self.bid_log.push_back(record);
        while self.bid_log.len() > BID_LOG_CAPACITY {
            self.bid_log.pop_front();
        }
    }
}
