//! The rolling day-cycle state machine.
//!
//! Driven entirely by the wall clock: every externally triggered request
//! calls `update_system_state` first, which repairs the calendar window,
//! advances past-due executing days (bounded catch-up), and finalizes
//! completed telemetry hours. Days move `open -> executing -> final`; at each
//! promotion the new executing day's winners are charged and every enabled
//! user receives their daily budget.

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::calendar;
use crate::error::ApiError;
use crate::ledger;
use crate::model::{Day, DayStatus, Slot, State, MAX_ADVANCE_PER_CALL, OPEN_DAY_WINDOW};
use crate::store::Store;

/// Build a fresh day with its full 24-slot grid.
fn new_day(key: &str, status: DayStatus, transition_hour: u8) -> Result<Day, ApiError> {
    let slots = calendar::slot_keys_for_day(key, transition_hour)?
        .into_iter()
        .map(|k| (k, Slot::new()))
        .collect();
    Ok(Day {
        day_start: key.to_string(),
        status,
        finalized_at: None,
        slots,
    })
}

impl Store {
    /// Bring the calendar up to date with `now` and finalize completed
    /// telemetry hours. Saves once if anything changed.
    #[instrument(skip(self), target = "daycycle", fields(now = %now))]
    pub fn update_system_state(&self, now: DateTime<Utc>) -> Result<(), ApiError> {
        let mut state = self.state.lock();

        let mut dirty = Self::ensure_window_locked(&mut state, now)?;

        let mut advanced = 0u32;
        let mut advance_err = None;
        loop {
            let Some(exec_key) = state.executing_day_key().map(str::to_string) else {
                break;
            };
            let close = calendar::day_close(&exec_key, state.config.transition_hour)?;
            if now < close {
                break;
            }
            if advanced >= MAX_ADVANCE_PER_CALL {
                warn!(
                    advanced,
                    behind_since = %exec_key,
                    "catch-up cap reached; remaining days advance on the next call"
                );
                break;
            }
            match Self::advance_day_cycle_locked(&mut state, now) {
                Ok(()) => {
                    advanced += 1;
                    dirty = true;
                }
                Err(e) => {
                    advance_err = Some(e);
                    break;
                }
            }
        }
        if advanced > 0 {
            dirty |= Self::ensure_window_locked(&mut state, now)?;
        }

        dirty |= Self::finalize_past_slots_locked(&mut state, now)?;

        if dirty {
            self.save_locked(&state)?;
        }
        match advance_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ensure one executing day and the six consecutive open days after it.
    /// Returns whether anything was created or repaired.
    fn ensure_window_locked(state: &mut State, now: DateTime<Utc>) -> Result<bool, ApiError> {
        let transition_hour = state.config.transition_hour;
        let mut changed = false;

        if state.executing_day_key().is_none() {
            let key = calendar::day_key_for(now, transition_hour);
            match state.days.get_mut(&key) {
                Some(day) => {
                    warn!(day = %key, was = %day.status, "repairing current day to executing");
                    day.status = DayStatus::Executing;
                }
                None => {
                    info!(day = %key, "creating executing day");
                    state
                        .days
                        .insert(key.clone(), new_day(&key, DayStatus::Executing, transition_hour)?);
                }
            }
            changed = true;
        }

        let exec_key = state
            .executing_day_key()
            .map(str::to_string)
            .ok_or_else(|| ApiError::internal("executing day missing after repair"))?;

        for offset in 1..=(OPEN_DAY_WINDOW as i64) {
            let key = calendar::day_key_offset(&exec_key, offset)?;
            match state.days.get_mut(&key) {
                Some(day) if day.status != DayStatus::Open => {
                    warn!(day = %key, was = %day.status, "repairing window day to open");
                    day.status = DayStatus::Open;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    state
                        .days
                        .insert(key.clone(), new_day(&key, DayStatus::Open, transition_hour)?);
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    /// One atomic rollover: finalize the executing day, promote the earliest
    /// open day (charging its winners and granting budgets), and append the
    /// new sixth open day.
    fn advance_day_cycle_locked(state: &mut State, now: DateTime<Utc>) -> Result<(), ApiError> {
        let transition_hour = state.config.transition_hour;
        let exec_key = state
            .executing_day_key()
            .map(str::to_string)
            .ok_or_else(|| ApiError::internal("no executing day to advance"))?;
        let Some(open_key) = state.open_day_keys().first().map(|s| s.to_string()) else {
            // Operator-induced inconsistency; never expected in normal operation.
            tracing::error!(executing = %exec_key, "no open day available for promotion");
            return Err(ApiError::internal("no open day to promote"));
        };

        let payouts = ledger::payouts(&state.days[&open_key]);
        for (username, amount) in &payouts {
            if let Some(user) = state.user_mut(username) {
                user.balance = ledger::charge(user.balance, *amount);
            }
        }
        for user in state.users.values_mut().filter(|u| u.enabled) {
            user.balance += user.daily_budget as f64;
        }

        if let Some(day) = state.days.get_mut(&exec_key) {
            day.status = DayStatus::Final;
            day.finalized_at.get_or_insert(now);
        }
        if let Some(day) = state.days.get_mut(&open_key) {
            day.status = DayStatus::Executing;
            day.finalized_at = Some(now);
        }

        let new_key = calendar::day_key_offset(&open_key, OPEN_DAY_WINDOW as i64)?;
        // Replaces any pre-existing entry at that key.
        state
            .days
            .insert(new_key.clone(), new_day(&new_key, DayStatus::Open, transition_hour)?);

        info!(
            finalized = %exec_key,
            promoted = %open_key,
            appended = %new_key,
            winners = payouts.len(),
            "day cycle advanced"
        );
        Ok(())
    }
}
