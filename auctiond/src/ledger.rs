//! Credit accounting helpers.
//!
//! Balances are non-negative reals; the public surface exposes the floored
//! integer. "Committed" is never stored; it is derived on demand from the
//! winners of all open days, which keeps it impossible to desynchronize.

use std::collections::BTreeMap;

use crate::model::{Day, DayStatus, State};

/// Total price of entries `username` currently wins across all open days.
pub fn committed(state: &State, username: &str) -> u64 {
    state
        .days
        .values()
        .filter(|d| d.status == DayStatus::Open)
        .map(|d| won_total(d, username))
        .sum()
}

/// Total price of entries `username` wins within one day.
pub fn won_total(day: &Day, username: &str) -> u64 {
    day.slots
        .values()
        .flat_map(|s| s.gpu_prices.iter())
        .filter(|e| e.is_won_by(username))
        .map(|e| e.price)
        .sum()
}

/// Per-winner totals for a day, used to charge at promotion time.
pub fn payouts(day: &Day) -> BTreeMap<String, u64> {
    let mut out: BTreeMap<String, u64> = BTreeMap::new();
    for entry in day.slots.values().flat_map(|s| s.gpu_prices.iter()) {
        if let Some(winner) = &entry.winner {
            *out.entry(winner.clone()).or_default() += entry.price;
        }
    }
    out
}

/// Deduct a charge, clamping at zero.
pub fn charge(balance: f64, amount: u64) -> f64 {
    (balance - amount as f64).max(0.0)
}
