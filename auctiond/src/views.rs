//! Read-only projections consumed by the external HTTP layer.
//!
//! Everything here runs under the state lock so multi-field reads are
//! consistent; nothing mutates. CSV formatting itself is external: the
//! schedule and usage exports get row projections with pre-formatted UTC
//! timestamps.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::Serialize;

use crate::calendar;
use crate::error::ApiError;
use crate::ledger;
use crate::model::{Day, DayStatus, Policy, Role, State};
use crate::store::{LiveUsage, Store};

#[derive(Debug, Clone, Serialize)]
pub struct DayOverview {
    pub day_key: String,
    pub status: String,
    pub open_at: DateTime<Utc>,
    pub close_at: DateTime<Utc>,
    pub has_notifications: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub role: Role,
    pub balance: u64,
    pub committed: u64,
    pub daily_budget: u64,
    pub enabled: bool,
    pub outbid_notifications: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub days: Vec<DayOverview>,
    pub user: UserSummary,
    pub policy: Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Open,
    Locked,
    Reserved,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridCell {
    pub gpu: u32,
    pub price: u64,
    pub winner: Option<String>,
    pub actual_user: Option<String>,
    pub status: CellStatus,
    #[serde(rename = "isMine")]
    pub is_mine: bool,
    #[serde(rename = "hasBid")]
    pub has_bid: bool,
    #[serde(rename = "canRelease")]
    pub can_release: bool,
    /// Only populated for the currently running hour.
    pub live_users: Option<Vec<String>>,
    pub most_frequent_user: Option<String>,
    pub most_frequent_non_owner: Option<String>,
    pub is_current_hour: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GridRow {
    pub slot_key: String,
    pub entries: Vec<GridCell>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayGrid {
    pub day_key: String,
    pub status: String,
    pub rows: Vec<GridRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OwnedEntry {
    pub day: String,
    pub slot: String,
    pub gpu: u32,
    pub price: u64,
    pub day_status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BidOutcome {
    /// The caller still holds the entry.
    Leading,
    /// Someone else holds it now.
    Lost,
    /// Nobody holds it (released or undone).
    Open,
}

#[derive(Debug, Clone, Serialize)]
pub struct BidHistoryEntry {
    pub day: String,
    pub slot: String,
    pub gpu: u32,
    pub price: u64,
    pub timestamp: DateTime<Utc>,
    pub outcome: BidOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleRow {
    pub slot_id: String,
    pub gpu_index: u32,
    pub start_time_utc: String,
    pub end_time_utc: String,
    pub winner_username: Option<String>,
    pub final_price: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// No winner, no observed user.
    Empty,
    /// Used without being won.
    Squatter,
    /// Won but never used.
    NoShow,
    Match,
    Mismatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRow {
    pub slot_id: String,
    pub gpu_index: u32,
    pub winner_username: Option<String>,
    pub actual_user: Option<String>,
    pub match_status: MatchStatus,
}

fn slot_id(slot_key: &str, gpu: u32) -> String {
    format!("{slot_key}_gpu{gpu}")
}

fn day_overview(state: &State, key: &str, user_notifications: &[String]) -> Result<DayOverview, ApiError> {
    let transition_hour = state.config.transition_hour;
    let prefix = format!("{key}|");
    let status = state
        .days
        .get(key)
        .map(|d| d.status.to_string())
        .unwrap_or_else(|| DayStatus::Future.to_string());
    Ok(DayOverview {
        day_key: key.to_string(),
        status,
        open_at: calendar::day_open(key, transition_hour)?,
        close_at: calendar::day_close(key, transition_hour)?,
        has_notifications: user_notifications.iter().any(|n| n.starts_with(&prefix)),
    })
}

impl Store {
    /// The landing view: executing day plus the open window, the caller's
    /// account summary, and the active policy.
    pub fn overview(&self, username: &str, _now: DateTime<Utc>) -> Result<Overview, ApiError> {
        let state = self.state.lock();
        let user = state
            .user(username)
            .ok_or_else(|| ApiError::not_found("user"))?;

        let mut keys: Vec<String> = Vec::new();
        if let Some(exec) = state.executing_day_key() {
            keys.push(exec.to_string());
        }
        keys.extend(state.open_day_keys().iter().map(|k| k.to_string()));

        let mut days = Vec::with_capacity(keys.len());
        for key in &keys {
            days.push(day_overview(&state, key, &user.outbid_notifications)?);
        }

        Ok(Overview {
            days,
            user: UserSummary {
                username: user.username.clone(),
                role: user.role,
                balance: user.balance_floor(),
                committed: ledger::committed(&state, username),
                daily_budget: user.daily_budget,
                enabled: user.enabled,
                outbid_notifications: user.outbid_notifications.clone(),
            },
            policy: state.policy.clone(),
        })
    }

    /// 24 x 8 grid for one day, annotated for the calling user.
    pub fn day_grid(
        &self,
        username: &str,
        day_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DayGrid, ApiError> {
        let live = self.live.lock().clone();
        let state = self.state.lock();
        let day = state
            .days
            .get(day_key)
            .ok_or_else(|| ApiError::not_found("day"))?;
        Ok(build_grid(&state, &live, day_key, day, username, now))
    }

    /// The caller's won entries across the executing day and the open window.
    pub fn my_summary(&self, username: &str) -> Result<Vec<OwnedEntry>, ApiError> {
        let state = self.state.lock();
        Self::ensure_bidder(&state, username)?;

        let mut owned = Vec::new();
        for (day_key, day) in &state.days {
            if !matches!(day.status, DayStatus::Executing | DayStatus::Open) {
                continue;
            }
            for (slot_key, slot) in &day.slots {
                for entry in &slot.gpu_prices {
                    if entry.is_won_by(username) {
                        owned.push(OwnedEntry {
                            day: day_key.clone(),
                            slot: slot_key.clone(),
                            gpu: entry.gpu,
                            price: entry.price,
                            day_status: day.status.to_string(),
                        });
                    }
                }
            }
        }
        Ok(owned)
    }

    /// The caller's most recent bid-log records, newest first, annotated
    /// with the entry's current outcome.
    pub fn my_bids(&self, username: &str, limit: usize) -> Result<Vec<BidHistoryEntry>, ApiError> {
        let state = self.state.lock();
        Self::ensure_bidder(&state, username)?;

        let mut out = Vec::new();
        for record in state.bid_log.iter().rev() {
            if record.username != username {
                continue;
            }
            let winner = state
                .days
                .get(&record.day)
                .and_then(|d| d.entry(&record.slot, record.gpu))
                .and_then(|e| e.winner.as_deref());
            let outcome = match winner {
                Some(w) if w == username => BidOutcome::Leading,
                Some(_) => BidOutcome::Lost,
                None => BidOutcome::Open,
            };
            out.push(BidHistoryEntry {
                day: record.day.clone(),
                slot: record.slot.clone(),
                gpu: record.gpu,
                price: record.price,
                timestamp: record.timestamp,
                outcome,
            });
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Keys of all final days, newest first.
    pub fn history_days(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .days
            .iter()
            .filter(|(_, d)| d.status == DayStatus::Final)
            .map(|(k, _)| k.clone())
            .collect();
        keys.reverse();
        keys
    }

    /// Grid of a historical (final) day.
    pub fn history_day(
        &self,
        username: &str,
        day_key: &str,
        now: DateTime<Utc>,
    ) -> Result<DayGrid, ApiError> {
        let live = self.live.lock().clone();
        let state = self.state.lock();
        let day = state
            .days
            .get(day_key)
            .filter(|d| d.status == DayStatus::Final)
            .ok_or_else(|| ApiError::not_found("day"))?;
        Ok(build_grid(&state, &live, day_key, day, username, now))
    }

    /// Schedule export rows for one day (times in UTC ISO-8601).
    pub fn schedule_rows(&self, day_key: &str) -> Result<Vec<ScheduleRow>, ApiError> {
        let state = self.state.lock();
        let day = state
            .days
            .get(day_key)
            .ok_or_else(|| ApiError::not_found("day"))?;

        let mut rows = Vec::new();
        for (slot_key, slot) in &day.slots {
            let start = calendar::slot_start_from_key(slot_key)?;
            let end = start + Duration::hours(1);
            for entry in &slot.gpu_prices {
                rows.push(ScheduleRow {
                    slot_id: slot_id(slot_key, entry.gpu),
                    gpu_index: entry.gpu,
                    start_time_utc: start.to_rfc3339_opts(SecondsFormat::Secs, true),
                    end_time_utc: end.to_rfc3339_opts(SecondsFormat::Secs, true),
                    winner_username: entry.winner.clone(),
                    final_price: entry.price,
                });
            }
        }
        Ok(rows)
    }

    /// Usage export rows: winner vs. sample-derived actual user.
    pub fn usage_rows(&self, day_key: &str) -> Result<Vec<UsageRow>, ApiError> {
        let state = self.state.lock();
        let day = state
            .days
            .get(day_key)
            .ok_or_else(|| ApiError::not_found("day"))?;

        let mut rows = Vec::new();
        for (slot_key, slot) in &day.slots {
            for entry in &slot.gpu_prices {
                let match_status = match (&entry.winner, &entry.actual_user) {
                    (None, None) => MatchStatus::Empty,
                    (None, Some(_)) => MatchStatus::Squatter,
                    (Some(_), None) => MatchStatus::NoShow,
                    (Some(w), Some(a)) if w == a => MatchStatus::Match,
                    _ => MatchStatus::Mismatch,
                };
                rows.push(UsageRow {
                    slot_id: slot_id(slot_key, entry.gpu),
                    gpu_index: entry.gpu,
                    winner_username: entry.winner.clone(),
                    actual_user: entry.actual_user.clone(),
                    match_status,
                });
            }
        }
        Ok(rows)
    }
}

fn build_grid(
    state: &State,
    live: &LiveUsage,
    day_key: &str,
    day: &Day,
    username: &str,
    now: DateTime<Utc>,
) -> DayGrid {
    let current_slot = calendar::slot_key_at(now);
    let release_cutoff = calendar::floor_hour(now) + Duration::hours(1);
    let samples = state.gpu_usage_tracking.get(day_key);

    let mut rows = Vec::with_capacity(day.slots.len());
    for (slot_key, slot) in &day.slots {
        let is_current_hour = day.status == DayStatus::Executing && *slot_key == current_slot;
        let slot_start = calendar::slot_start_from_key(slot_key).ok();

        let entries = slot
            .gpu_prices
            .iter()
            .map(|entry| {
                let reserved = state.policy.is_reserved(day_key, slot_key, entry.gpu);
                let status = if reserved {
                    CellStatus::Reserved
                } else if day.status == DayStatus::Open {
                    CellStatus::Open
                } else {
                    CellStatus::Locked
                };
                let is_mine = entry.is_won_by(username);

                let hist = samples
                    .and_then(|d| d.get(slot_key))
                    .and_then(|s| s.get(&entry.gpu));
                let most_frequent_user = hist.and_then(|h| argmax(h, None));
                let most_frequent_non_owner =
                    hist.and_then(|h| argmax(h, entry.winner.as_deref()));

                GridCell {
                    gpu: entry.gpu,
                    price: entry.price,
                    winner: entry.winner.clone(),
                    actual_user: entry.actual_user.clone(),
                    status,
                    is_mine,
                    has_bid: entry.bids.iter().any(|b| b.username == username),
                    can_release: day.status == DayStatus::Executing
                        && is_mine
                        && slot_start.is_some_and(|s| s >= release_cutoff),
                    live_users: if is_current_hour {
                        live.usage.get(&entry.gpu).cloned()
                    } else {
                        None
                    },
                    most_frequent_user,
                    most_frequent_non_owner,
                    is_current_hour,
                }
            })
            .collect();

        rows.push(GridRow {
            slot_key: slot_key.clone(),
            entries,
        });
    }

    DayGrid {
        day_key: day_key.to_string(),
        status: day.status.to_string(),
        rows,
    }
}

/// Most-seen user in a histogram, excluding `exclude`; insertion order
/// breaks ties.
fn argmax(hist: &indexmap::IndexMap<String, u64>, exclude: Option<&str>) -> Option<String> {
    let mut best: Option<(&str, u64)> = None;
    for (user, count) in hist {
        if exclude.is_some_and(|x| x == user) {
            continue;
        }
        if best.is_none_or(|(_, c)| *count > c) {
            best = Some((user.as_str(), *count));
        }
    }
    best.map(|(u, _)| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SlotRef;
    use crate::testutil::{seed_day, seed_user, test_store};
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn noon() -> DateTime<Utc> {
        utc(2025, 6, 15, 16, 0, 0) // 12:00 EDT
    }

    #[test]
    fn overview_lists_executing_plus_open_window() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.5, 7);
        store.update_system_state(noon()).unwrap();

        let t = SlotRef::new("2025-06-16", "2025-06-16T09:00", 0);
        store.place_bid("alice", &t, noon()).unwrap();

        let view = store.overview("alice", noon()).unwrap();
        assert_eq!(view.days.len(), 7);
        assert_eq!(view.days[0].day_key, "2025-06-15");
        assert_eq!(view.days[0].status, "executing");
        assert!(view.days[1..].iter().all(|d| d.status == "open"));
        assert_eq!(view.user.balance, 10);
        assert_eq!(view.user.committed, 1);
        assert_eq!(view.user.daily_budget, 7);
    }

    #[test]
    fn overview_flags_days_with_notifications() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.0, 0);
        seed_user(&store, "bob", 10.0, 0);
        store.update_system_state(noon()).unwrap();

        let t = SlotRef::new("2025-06-17", "2025-06-17T09:00", 0);
        store.place_bid("alice", &t, noon()).unwrap();
        store.place_bid("bob", &t, noon()).unwrap();

        let view = store.overview("alice", noon()).unwrap();
        let flagged: Vec<&str> = view
            .days
            .iter()
            .filter(|d| d.has_notifications)
            .map(|d| d.day_key.as_str())
            .collect();
        assert_eq!(flagged, vec!["2025-06-17"]);
    }

    #[test]
    fn grid_cells_carry_ownership_and_status() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.0, 0);
        seed_user(&store, "bob", 10.0, 0);
        store.update_system_state(noon()).unwrap();

        let t = SlotRef::new("2025-06-16", "2025-06-16T09:00", 2);
        store.place_bid("alice", &t, noon()).unwrap();
        store.place_bid("bob", &t, noon()).unwrap();
        store
            .set_reserved("admin", &SlotRef::new("2025-06-16", "2025-06-16T10:00", 0), true)
            .unwrap();

        let grid = store.day_grid("alice", "2025-06-16", noon()).unwrap();
        assert_eq!(grid.rows.len(), 24);

        let row9 = grid.rows.iter().find(|r| r.slot_key == "2025-06-16T09:00").unwrap();
        let cell = &row9.entries[2];
        assert_eq!(cell.price, 2);
        assert_eq!(cell.winner.as_deref(), Some("bob"));
        assert!(!cell.is_mine);
        assert!(cell.has_bid);
        assert_eq!(cell.status, CellStatus::Open);
        assert!(!cell.can_release);

        let row10 = grid.rows.iter().find(|r| r.slot_key == "2025-06-16T10:00").unwrap();
        assert_eq!(row10.entries[0].status, CellStatus::Reserved);
    }

    #[test]
    fn grid_marks_the_running_hour_with_live_users() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.0, 0);
        store.update_system_state(noon()).unwrap();

        store.ingest_gpu_usage(
            &crate::telemetry::UsagePayload {
                timestamp: None,
                usage: [("3".to_string(), vec!["carol".to_string()])].into(),
            },
            noon(),
        );

        let grid = store.day_grid("alice", "2025-06-15", noon()).unwrap();
        let current = grid.rows.iter().find(|r| r.slot_key == "2025-06-15T12:00").unwrap();
        assert!(current.entries[3].is_current_hour);
        assert_eq!(
            current.entries[3].live_users.as_deref(),
            Some(["carol".to_string()].as_slice())
        );
        // Other hours carry no live view.
        let other = grid.rows.iter().find(|r| r.slot_key == "2025-06-15T09:00").unwrap();
        assert!(other.entries[3].live_users.is_none());
        assert_eq!(other.entries[3].status, CellStatus::Locked);
    }

    #[test]
    fn my_bids_reports_current_outcomes() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.0, 0);
        seed_user(&store, "bob", 10.0, 0);
        store.update_system_state(noon()).unwrap();

        let kept = SlotRef::new("2025-06-16", "2025-06-16T09:00", 0);
        let lost = SlotRef::new("2025-06-16", "2025-06-16T10:00", 1);
        store.place_bid("alice", &kept, noon()).unwrap();
        store.place_bid("alice", &lost, noon()).unwrap();
        store.place_bid("bob", &lost, noon()).unwrap();

        let bids = store.my_bids("alice", 10).unwrap();
        assert_eq!(bids.len(), 2);
        // Newest first.
        assert_eq!(bids[0].slot, "2025-06-16T10:00");
        assert_eq!(bids[0].outcome, BidOutcome::Lost);
        assert_eq!(bids[1].outcome, BidOutcome::Leading);

        let bids = store.my_bids("alice", 1).unwrap();
        assert_eq!(bids.len(), 1);
    }

    #[test]
    fn my_summary_spans_executing_and_open_days() {
        let (_dir, store) = test_store();
        seed_user(&store, "alice", 10.0, 0);
        store.update_system_state(noon()).unwrap();

        store
            .place_bid("alice", &SlotRef::new("2025-06-16", "2025-06-16T09:00", 0), noon())
            .unwrap();
        store
            .place_bid("alice", &SlotRef::new("2025-06-18", "2025-06-18T22:00", 5), noon())
            .unwrap();

        let owned = store.my_summary("alice").unwrap();
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].day, "2025-06-16");
        assert_eq!(owned[1].gpu, 5);
    }

    #[test]
    fn schedule_rows_use_utc_iso_timestamps() {
        let (_dir, store) = test_store();
        store.update_system_state(noon()).unwrap();

        let rows = store.schedule_rows("2025-06-16").unwrap();
        assert_eq!(rows.len(), 24 * 8);

        let row = rows
            .iter()
            .find(|r| r.slot_id == "2025-06-16T09:00_gpu3")
            .unwrap();
        // 09:00 EDT = 13:00Z.
        assert_eq!(row.start_time_utc, "2025-06-16T13:00:00Z");
        assert_eq!(row.end_time_utc, "2025-06-16T14:00:00Z");
        assert_eq!(row.final_price, 0);
        assert!(row.winner_username.is_none());
    }

    #[test]
    fn usage_rows_classify_all_match_states() {
        let (_dir, store) = test_store();
        seed_day(&store, "2025-06-14", crate::model::DayStatus::Final);
        {
            let mut state = store.state.lock();
            let day = state.days.get_mut("2025-06-14").unwrap();

            let e = day.entry_mut("2025-06-14T09:00", 0).unwrap();
            e.winner = Some("alice".into());
            e.price = 2;
            e.actual_user = Some("alice".into());

            let e = day.entry_mut("2025-06-14T09:00", 1).unwrap();
            e.winner = Some("alice".into());
            e.price = 2;
            e.actual_user = Some("bob".into());

            let e = day.entry_mut("2025-06-14T09:00", 2).unwrap();
            e.winner = Some("alice".into());
            e.price = 2;

            let e = day.entry_mut("2025-06-14T09:00", 3).unwrap();
            e.actual_user = Some("bob".into());
        }

        let rows = store.usage_rows("2025-06-14").unwrap();
        let status_of = |gpu: u32| {
            rows.iter()
                .find(|r| r.slot_id == "2025-06-14T09:00_gpu".to_string() + &gpu.to_string())
                .unwrap()
                .match_status
        };
        assert_eq!(status_of(0), MatchStatus::Match);
        assert_eq!(status_of(1), MatchStatus::Mismatch);
        assert_eq!(status_of(2), MatchStatus::NoShow);
        assert_eq!(status_of(3), MatchStatus::Squatter);
        assert_eq!(status_of(4), MatchStatus::Empty);
    }

    #[test]
    fn history_exposes_only_final_days() {
        let (_dir, store) = test_store();
        seed_day(&store, "2025-06-13", crate::model::DayStatus::Final);
        seed_day(&store, "2025-06-14", crate::model::DayStatus::Final);
        store.update_system_state(noon()).unwrap();

        assert_eq!(store.history_days(), vec!["2025-06-14", "2025-06-13"]);

        seed_user(&store, "alice", 10.0, 0);
        assert!(store.history_day("alice", "2025-06-14", noon()).is_ok());
        assert_eq!(
            store.history_day("alice", "2025-06-15", noon()).unwrap_err().kind(),
            "not-found"
        );
    }
}
