//! The auction engine: single bids, atomic bulk bids, undo, and the
//! outbid-notification queue.
//!
//! Every mutation runs with the target entries' slot locks held (canonical
//! order) and then the state lock, and ends with one snapshot save. Bulk
//! bids are all-or-nothing: any validation failure aborts before the first
//! entry is touched.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::error::ApiError;
use crate::ledger;
use crate::model::{BidEntry, BidRecord, DayStatus, GpuEntry, SlotRef, State, GPU_COUNT};
use crate::store::Store;

/// Outcome of one accepted bid.
#[derive(Debug, Clone)]
pub struct BidReceipt {
    pub target: SlotRef,
    pub price: u64,
    /// Users displaced or re-notified by this bid.
    pub outbid: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BulkBidReceipt {
    pub bids: Vec<BidReceipt>,
    pub total_cost: u64,
}

impl Store {
    /// Bid on one entry of an open day. The accepted price is always the
    /// current price plus one.
    #[instrument(skip(self, now), target = "auction", fields(username, entry = %target))]
    pub fn place_bid(
        &self,
        username: &str,
        target: &SlotRef,
        now: DateTime<Utc>,
    ) -> Result<BidReceipt, ApiError> {
        let _slot = self.slot_locks.acquire(target);
        let mut state = self.state.lock();

        Self::ensure_bidder(&state, username)?;
        let entry = Self::validate_bid_target(&state, target)?;
        let (current_price, owned) = (entry.price, entry.is_won_by(username));

        let committed = ledger::committed(&state, username);
        let own_current = if owned { current_price } else { 0 };
        let budget_needed = committed.saturating_sub(own_current) + current_price + 1;
        let balance_floor = state
            .user(username)
            .map(|u| u.balance_floor())
            .unwrap_or_default();
        if budget_needed > balance_floor {
            debug!(budget_needed, balance_floor, "bid rejected: insufficient credit");
            return Err(ApiError::InsufficientCredit);
        }

        let receipt = Self::apply_bid_locked(&mut state, username, target, now)?;
        self.save_locked(&state)?;
        info!(price = receipt.price, outbid = receipt.outbid.len(), "bid accepted");
        Ok(receipt)
    }

    /// Atomic multi-slot bid. Targets are normalized (sorted, deduplicated);
    /// either every bid is applied with one shared timestamp and one save,
    /// or none is.
    #[instrument(skip(self, targets, now), target = "auction", fields(username, count = targets.len()))]
    pub fn place_bulk_bid(
        &self,
        username: &str,
        targets: &[SlotRef],
        now: DateTime<Utc>,
    ) -> Result<BulkBidReceipt, ApiError> {
        if targets.is_empty() {
            return Err(ApiError::bad_request("no bids supplied"));
        }
        let mut normalized = targets.to_vec();
        normalized.sort();
        normalized.dedup();

        let _locks = self.slot_locks.acquire_ordered(&normalized);
        let mut state = self.state.lock();

        Self::ensure_bidder(&state, username)?;

        // Validate everything before mutating anything.
        let mut total_cost: u64 = 0;
        let mut own_current_total: u64 = 0;
        for target in &normalized {
            let entry = Self::validate_bid_target(&state, target)?;
            total_cost += entry.price + 1;
            if entry.is_won_by(username) {
                own_current_total += entry.price;
            }
        }

        let committed = ledger::committed(&state, username);
        let budget_needed = committed.saturating_sub(own_current_total) + total_cost;
        let balance_floor = state
            .user(username)
            .map(|u| u.balance_floor())
            .unwrap_or_default();
        if budget_needed > balance_floor {
            debug!(budget_needed, balance_floor, "bulk bid rejected: insufficient credit");
            return Err(ApiError::InsufficientCredit);
        }

        let mut bids = Vec::with_capacity(normalized.len());
        for target in &normalized {
            bids.push(Self::apply_bid_locked(&mut state, username, target, now)?);
        }
        self.save_locked(&state)?;
        info!(count = bids.len(), total_cost, "bulk bid accepted");
        Ok(BulkBidReceipt { bids, total_cost })
    }

    /// Undo the caller's trailing bid, restoring the supplied prior state.
    ///
    /// Only valid while the day is open and only when the caller's bid did
    /// not displace another user: an undo whose `previous_winner` is a third
    /// party is a `conflict`.
    #[instrument(skip(self), target = "auction", fields(username, entry = %target))]
    pub fn undo_bid(
        &self,
        username: &str,
        target: &SlotRef,
        previous_winner: Option<&str>,
        previous_price: u64,
    ) -> Result<(), ApiError> {
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
        if day.status != DayStatus::Open {
            return Err(ApiError::DayNotOpen);
        }
        let entry = day
            .entry(&target.slot, target.gpu)
            .ok_or_else(|| ApiError::not_found("slot"))?;
        if !entry.is_won_by(username) {
            return Err(ApiError::NotOwner);
        }

        if previous_winner.is_some_and(|w| w != username) {
            return Err(ApiError::Conflict);
        }

        // The trailing bid must be the caller's, and the supplied prior
        // state must match what popping it would leave behind.
        match entry.bids.last() {
            Some(last) if last.username == username => {}
            _ => return Err(ApiError::Conflict),
        }
        let prior = entry.bids.len().checked_sub(2).and_then(|i| entry.bids.get(i));
        let consistent = match (prior, previous_winner) {
            (None, None) => previous_price == 0,
            (Some(p), Some(w)) => p.username == w && p.price == previous_price,
            _ => false,
        };
        if !consistent {
            return Err(ApiError::Conflict);
        }

        let entry = state
            .days
            .get_mut(&target.day)
            .and_then(|d| d.entry_mut(&target.slot, target.gpu))
            .ok_or_else(|| ApiError::internal("entry vanished under its lock"))?;
        entry.bids.pop();
        entry.price = previous_price;
        entry.winner = previous_winner.map(str::to_string);

        self.save_locked(&state)?;
        info!(restored_price = previous_price, "bid undone");
        Ok(())
    }

    /// Drop every queued outbid notification for `day_key`. Returns how many
    /// were removed.
    #[instrument(skip(self), target = "auction", fields(username, day_key))]
    pub fn dismiss_outbid(&self, username: &str, day_key: &str) -> Result<usize, ApiError> {
        let mut state = self.state.lock();
        let prefix = format!("{day_key}|");
        let user = state
            .user_mut(username)
            .ok_or_else(|| ApiError::not_found("user"))?;

        let before = user.outbid_notifications.len();
        user.outbid_notifications.retain(|n| !n.starts_with(&prefix));
        let removed = before - user.outbid_notifications.len();

        if removed > 0 {
            self.save_locked(&state)?;
        }
        Ok(removed)
    }

    // =========================
    // Locked helpers
    // =========================

    pub(crate) fn ensure_bidder(state: &State, username: &str) -> Result<(), ApiError> {
        match state.user(username) {
            Some(u) if u.enabled => Ok(()),
            Some(_) => Err(ApiError::Forbidden),
            None => Err(ApiError::not_found("user")),
        }
    }

    /// All single-bid preconditions except credit; returns the entry.
    fn validate_bid_target<'a>(
        state: &'a State,
        target: &SlotRef,
    ) -> Result<&'a GpuEntry, ApiError> {
        if target.gpu >= GPU_COUNT {
            return Err(ApiError::bad_request("gpu index out of range"));
        }
        let day = state
            .days
            .get(&target.day)
            .ok_or_else(|| ApiError::not_found("day"))?;
        if day.status != DayStatus::Open {
            return Err(ApiError::DayNotOpen);
        }
        let slot = day
            .slots
            .get(&target.slot)
            .ok_or_else(|| ApiError::not_found("slot"))?;
        if state.policy.is_reserved(&target.day, &target.slot, target.gpu) {
            return Err(ApiError::Reserved);
        }
        slot.entry(target.gpu)
            .ok_or_else(|| ApiError::internal("gpu entry missing from slot"))
    }

    /// Apply one validated bid: bump price, move the winner, queue outbid
    /// notifications, append to the global log. Caller saves.
    fn apply_bid_locked(
        state: &mut State,
        username: &str,
        target: &SlotRef,
        now: DateTime<Utc>,
    ) -> Result<BidReceipt, ApiError> {
        let (new_price, outbid) = {
            let entry = state
                .days
                .get_mut(&target.day)
                .and_then(|d| d.entry_mut(&target.slot, target.gpu))
                .ok_or_else(|| ApiError::internal("entry vanished under its lock"))?;

            let new_price = entry.price + 1;
            let mut outbid: Vec<String> = Vec::new();
            for bid in &entry.bids {
                if bid.username != username && !outbid.contains(&bid.username) {
                    outbid.push(bid.username.clone());
                }
            }

            entry.price = new_price;
            entry.winner = Some(username.to_string());
            entry.bids.push(BidEntry {
                username: username.to_string(),
                price: new_price,
                timestamp: now,
            });
            (new_price, outbid)
        };

        let notification = target.notification_key();
        for displaced in &outbid {
            if let Some(user) = state.user_mut(displaced) {
                if !user.outbid_notifications.contains(&notification) {
                    user.outbid_notifications.push(notification.clone());
                }
            }
        }

        state.push_bid_record(BidRecord {
            username: username.to_string(),
            day: target.day.clone(),
            slot: target.slot.clone(),
            gpu: target.gpu,
            price: new_price,
            timestamp: now,
        });

        Ok(BidReceipt {
            target: target.clone(),
            price: new_price,
            outbid,
        })
    }
}
