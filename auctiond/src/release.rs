//! Releasing owned future slots on the executing day.
//!
//! Two deliberately different refund policies: releasing a single slot
//! returns half its price; dropping a whole block via bulk release returns a
//! flat per-slot stipend so speculative mass-bidding stays expensive.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument};

use crate::calendar;
use crate::error::ApiError;
use crate::model::{DayStatus, SlotRef, GPU_COUNT};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ReleaseReceipt {
    pub target: SlotRef,
    pub refund: f64,
}

#[derive(Debug, Clone)]
pub struct BulkReleaseReceipt {
    pub released: Vec<SlotRef>,
    pub skipped: usize,
    pub refund: f64,
}

impl Store {
    /// Give up one owned entry whose hour has not started yet (at least one
    /// full hour out). Refunds half the standing price.
    #[instrument(skip(self, now), target = "release", fields(username, entry = %target))]
    pub fn release_slot(
        &self,
        username: &str,
        target: &SlotRef,
        now: DateTime<Utc>,
    ) -> Result<ReleaseReceipt, ApiError> {
        let _slot = self.slot_locks.acquire(target);
        let mut state = self.state.lock();

        Self::ensure_bidder(&state, username)?;
        if target.gpu >= GPU_COUNT {
            return Err(ApiError::bad_request("gpu index out of range"));
        }
        let day = state
            .days
            .get(&target.day)
            .ok_or_else(|| ApiError::not_found("day"))?;
        if day.status != DayStatus::Executing {
            return Err(ApiError::bad_request("only executing-day slots can be released"));
        }
        let entry = day
            .entry(&target.slot, target.gpu)
            .ok_or_else(|| ApiError::not_found("slot"))?;
        if !entry.is_won_by(username) {
            return Err(ApiError::NotOwner);
        }

        let slot_start = calendar::slot_start_from_key(&target.slot)?;
        let cutoff = calendar::floor_hour(now) + Duration::hours(1);
        if slot_start < cutoff {
            return Err(ApiError::TooLateToRelease);
        }

        let refund = entry.price as f64 * 0.5;
        let entry = state
            .days
            .get_mut(&target.day)
            .and_then(|d| d.entry_mut(&target.slot, target.gpu))
            .ok_or_else(|| ApiError::internal("entry vanished under its lock"))?;
        entry.clear();
        if let Some(user) = state.user_mut(username) {
            user.balance += refund;
        }

        self.save_locked(&state)?;
        info!(refund, "slot released");
        Ok(ReleaseReceipt {
            target: target.clone(),
            refund,
        })
    }

    /// Release a batch of owned future slots. Ineligible items are skipped
    /// silently; the refund is a flat per-released-slot stipend applied as
    /// one balance increment.
    #[instrument(skip(self, targets, now), target = "release", fields(username, count = targets.len()))]
    pub fn release_bulk(
        &self,
        username: &str,
        targets: &[SlotRef],
        now: DateTime<Utc>,
    ) -> Result<BulkReleaseReceipt, ApiError> {
        if targets.is_empty() {
            return Err(ApiError::bad_request("no slots supplied"));
        }
        let mut normalized = targets.to_vec();
        normalized.sort();
        normalized.dedup();

        let _locks = self.slot_locks.acquire_ordered(&normalized);
        let mut state = self.state.lock();

        Self::ensure_bidder(&state, username)?;
        let cutoff = calendar::floor_hour(now) + Duration::hours(1);

        let mut released = Vec::new();
        for target in &normalized {
            let eligible = target.gpu < GPU_COUNT
                && state.days.get(&target.day).is_some_and(|day| {
                    day.status == DayStatus::Executing
                        && day
                            .entry(&target.slot, target.gpu)
                            .is_some_and(|e| e.is_won_by(username))
                })
                && !state.policy.is_reserved(&target.day, &target.slot, target.gpu)
                && calendar::slot_start_from_key(&target.slot).is_ok_and(|start| start >= cutoff);

            if !eligible {
                debug!(entry = %target, "skipping ineligible release target");
                continue;
            }

            if let Some(entry) = state
                .days
                .get_mut(&target.day)
                .and_then(|d| d.entry_mut(&target.slot, target.gpu))
            {
                entry.clear();
                released.push(target.clone());
            }
        }

        let refund = released.len() as f64 * self.cfg.bulk_release_refund;
        if let Some(user) = state.user_mut(username) {
            user.balance += refund;
        }

        if !released.is_empty() {
            self.save_locked(&state)?;
        }
        info!(
            released = released.len(),
            skipped = normalized.len() - released.len(),
            refund,
            "bulk release complete"
        );
        Ok(BulkReleaseReceipt {
            skipped: normalized.len() - released.len(),
            released,
            refund,
        })
    }
}
