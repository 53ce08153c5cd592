//! Telemetry ingestion from the external GPU monitoring daemon.
//!
//! The daemon polls nvidia-smi (or similar) and pushes per-GPU user lists.
//! The server clock decides which (day, slot) a sample belongs to; the
//! payload timestamp only feeds a clock-skew warning. Samples accumulate in
//! per-hour histograms that, once the hour has fully elapsed, label each
//! entry with its winner-independent "actual user".

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::auth;
use crate::calendar;
use crate::error::ApiError;
use crate::model::{DayStatus, State, GPU_COUNT, SAMPLE_RETENTION_DAYS};
use crate::store::Store;

/// Maximum tolerated monitor/server clock divergence before warning.
const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Wire payload of the monitoring daemon. GPU indices arrive stringified.
#[derive(Debug, Clone, Deserialize)]
pub struct UsagePayload {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub gpus_reported: usize,
    pub samples_recorded: u64,
}

/// Snapshot served to `/api/gpu-live-status`.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub usage: BTreeMap<u32, Vec<String>>,
    pub timestamp: Option<DateTime<Utc>>,
    pub gpu_count: u32,
}

impl Store {
    /// Constant-time bearer check for the telemetry sink. With no token
    /// configured every push is rejected.
    pub fn authorize_monitor(&self, bearer: Option<&str>) -> Result<(), ApiError> {
        let Some(expected) = self.cfg.monitor_token.as_deref() else {
            warn!("GPU_MONITOR_TOKEN unset; rejecting telemetry push");
            return Err(ApiError::Forbidden);
        };
        let supplied = bearer.ok_or(ApiError::AuthRequired)?;
        if auth::tokens_match(supplied, expected) {
            Ok(())
        } else {
            Err(ApiError::AuthInvalid)
        }
    }

    /// Record one monitoring poll: replace the live view wholesale and bump
    /// the current hour's histograms. Malformed entries are skipped; the
    /// push itself always succeeds.
    #[instrument(skip(self, payload), target = "telemetry", fields(gpus = payload.usage.len()))]
    pub fn ingest_gpu_usage(&self, payload: &UsagePayload, now: DateTime<Utc>) -> IngestSummary {
        if let Some(ts) = payload.timestamp {
            let skew = (now - ts).num_seconds().abs();
            if skew > MAX_CLOCK_SKEW_SECS {
                warn!(skew_secs = skew, "monitor clock skew exceeds threshold");
            }
        }

        let mut parsed: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for (gpu_raw, users) in &payload.usage {
            let Ok(gpu) = gpu_raw.parse::<u32>() else {
                debug!(gpu = %gpu_raw, "skipping malformed gpu index");
                continue;
            };
            if gpu >= GPU_COUNT {
                debug!(gpu, "skipping out-of-range gpu index");
                continue;
            }
            parsed.insert(
                gpu,
                users.iter().filter(|u| !u.is_empty()).cloned().collect(),
            );
        }

        {
            let mut live = self.live.lock();
            live.usage = parsed.clone();
            live.timestamp = Some(now);
        }

        let mut samples_recorded = 0u64;
        {
            let mut state = self.state.lock();
            let day_key = calendar::day_key_for(now, state.config.transition_hour);
            let slot_key = calendar::slot_key_at(now);
            let per_slot = state
                .gpu_usage_tracking
                .entry(day_key)
                .or_default()
                .entry(slot_key)
                .or_default();
            for (gpu, users) in &parsed {
                if users.is_empty() {
                    continue;
                }
                let hist = per_slot.entry(*gpu).or_default();
                for user in users {
                    *hist.entry(user.clone()).or_insert(0) += 1;
                    samples_recorded += 1;
                }
            }
        }

        IngestSummary {
            gpus_reported: parsed.len(),
            samples_recorded,
        }
    }

    pub fn live_status(&self) -> LiveStatus {
        let live = self.live.lock();
        LiveStatus {
            usage: live.usage.clone(),
            timestamp: live.timestamp,
            gpu_count: GPU_COUNT,
        }
    }

    /// Label every completed, sampled hour with its most-seen user, then
    /// prune histograms past retention. Returns whether state changed;
    /// the caller saves.
    pub(crate) fn finalize_past_slots_locked(
        state: &mut State,
        now: DateTime<Utc>,
    ) -> Result<bool, ApiError> {
        let floor_now = calendar::floor_hour(now);
        let mut dirty = false;

        let State {
            days,
            gpu_usage_tracking,
            config,
            ..
        } = state;

        for (day_key, slots) in gpu_usage_tracking.iter() {
            let Some(day) = days.get_mut(day_key) else {
                continue;
            };
            if !matches!(day.status, DayStatus::Executing | DayStatus::Final) {
                continue;
            }
            for (slot_key, gpus) in slots {
                let Ok(end) = calendar::slot_end_from_key(slot_key) else {
                    warn!(slot = %slot_key, "unparseable slot key in sample table");
                    continue;
                };
                if end > floor_now {
                    continue;
                }
                for (gpu, hist) in gpus {
                    if hist.is_empty() {
                        continue;
                    }
                    let Some(entry) = day.entry_mut(slot_key, *gpu) else {
                        continue;
                    };
                    // Written at most once per entry.
                    if entry.actual_user.is_some() {
                        continue;
                    }
                    let mut best: Option<(&str, u64)> = None;
                    for (user, count) in hist {
                        // Strictly greater: insertion order breaks ties.
                        if best.is_none_or(|(_, c)| *count > c) {
                            best = Some((user.as_str(), *count));
                        }
                    }
                    if let Some((user, count)) = best {
                        debug!(day = %day_key, slot = %slot_key, gpu, user, count, "labelled actual user");
                        entry.actual_user = Some(user.to_string());
                        dirty = true;
                    }
                }
            }
        }

        let today = calendar::day_key_for(now, config.transition_hour);
        let cutoff = calendar::day_key_offset(&today, -SAMPLE_RETENTION_DAYS)?;
        let before = gpu_usage_tracking.len();
        gpu_usage_tracking.retain(|k, _| k.as_str() >= cutoff.as_str());
        if gpu_usage_tracking.len() != before {
            dirty = true;
        }

        Ok(dirty)
    }
}
