//! Civil-time math for the auction calendar.
//!
//! All scheduling happens in a fixed IANA zone. A *logical day* is the
//! 24-hour interval anchored at `transition_hour:00` local time and keyed by
//! the calendar date of its start (`YYYY-MM-DD`). Slots are keyed by the
//! wall-clock timestamp at which their hour starts (`YYYY-MM-DDTHH:00`), so
//! slot keys stay stable when the transition hour is reconfigured; only the
//! grouping of hours into days changes going forward.
//!
//! Nothing here reads the system clock: callers pass `now` in, the same way
//! the scheduler tick receives its timestamp.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::ApiError;

/// The cluster lives in one zone; users bid in its wall-clock hours.
pub const ZONE: Tz = chrono_tz::America::New_York;

const DAY_KEY_FMT: &str = "%Y-%m-%d";
const SLOT_KEY_FMT: &str = "%Y-%m-%dT%H:00";

/// Resolve a naive local timestamp in [`ZONE`].
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// DST gap are shifted forward one hour.
fn localize(naive: NaiveDateTime) -> Result<DateTime<Tz>, ApiError> {
    if let Some(t) = ZONE.from_local_datetime(&naive).earliest() {
        return Ok(t);
    }
    ZONE.from_local_datetime(&(naive + Duration::hours(1)))
        .earliest()
        .ok_or_else(|| ApiError::internal(format!("unresolvable local time {naive}")))
}

fn parse_day_key(key: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(key, DAY_KEY_FMT)
        .map_err(|_| ApiError::bad_request(format!("malformed day key {key:?}")))
}

/// Key of the logical day containing `now`: the most recent local
/// `transition_hour:00` not after `now` names the day.
pub fn day_key_for(now: DateTime<Utc>, transition_hour: u8) -> String {
    let local = now.with_timezone(&ZONE);
    let date = if local.hour() >= u32::from(transition_hour) {
        local.date_naive()
    } else {
        local.date_naive().pred_opt().unwrap_or(local.date_naive())
    };
    date.format(DAY_KEY_FMT).to_string()
}

/// Day key `days` calendar days after (or before, if negative) `key`.
pub fn day_key_offset(key: &str, days: i64) -> Result<String, ApiError> {
    let date = parse_day_key(key)? + Duration::days(days);
    Ok(date.format(DAY_KEY_FMT).to_string())
}

/// Instant at which the logical day opens: `transition_hour:00` local time
/// on the key's date.
pub fn day_open(key: &str, transition_hour: u8) -> Result<DateTime<Utc>, ApiError> {
    let date = parse_day_key(key)?;
    let naive = date
        .and_hms_opt(u32::from(transition_hour), 0, 0)
        .ok_or_else(|| ApiError::bad_request(format!("invalid transition hour {transition_hour}")))?;
    Ok(localize(naive)?.with_timezone(&Utc))
}

/// Last instant of the logical day: open + 24h - 1s.
pub fn day_close(key: &str, transition_hour: u8) -> Result<DateTime<Utc>, ApiError> {
    Ok(day_open(key, transition_hour)? + Duration::hours(24) - Duration::seconds(1))
}

/// The 24 slot keys of a logical day, in chronological order.
///
/// Keys carry the wall-clock label of each hour's start, so a day whose
/// transition hour is nonzero spills onto the next calendar date.
pub fn slot_keys_for_day(key: &str, transition_hour: u8) -> Result<Vec<String>, ApiError> {
    let open = day_open(key, transition_hour)?;
    let mut keys = Vec::with_capacity(24);
    for h in 0..24 {
        let k = slot_key_at(open + Duration::hours(h));
        // DST fall-back repeats a wall-clock label; one slot per label.
        if !keys.contains(&k) {
            keys.push(k);
        }
    }
    Ok(keys)
}

/// Wall-clock slot label of the hour containing `t`.
pub fn slot_key_at(t: DateTime<Utc>) -> String {
    t.with_timezone(&ZONE).format(SLOT_KEY_FMT).to_string()
}

/// Start instant encoded in a slot key.
pub fn slot_start_from_key(slot_key: &str) -> Result<DateTime<Utc>, ApiError> {
    let naive = NaiveDateTime::parse_from_str(slot_key, "%Y-%m-%dT%H:%M")
        .map_err(|_| ApiError::bad_request(format!("malformed slot key {slot_key:?}")))?;
    Ok(localize(naive)?.with_timezone(&Utc))
}

/// End instant of a slot (start + 1h).
pub fn slot_end_from_key(slot_key: &str) -> Result<DateTime<Utc>, ApiError> {
    Ok(slot_start_from_key(slot_key)? + Duration::hours(1))
}

/// `now` truncated to the start of its wall-clock hour.
pub fn floor_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&ZONE);
    let naive = local
        .date_naive()
        .and_hms_opt(local.hour(), 0, 0)
        .unwrap_or_else(|| local.naive_local());
    localize(naive)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(now)
}

/// Calendar hour at which logical hour `h` of a day starts.
pub fn logical_hour_to_calendar(h: u8, transition_hour: u8) -> u8 {
    (transition_hour + h) % 24
}

/// Logical hour of calendar hour `c`. `on_current_day` says whether `c`
/// falls on the day's first calendar date or has wrapped past midnight.
pub fn calendar_to_logical(c: u8, transition_hour: u8, on_current_day: bool) -> u8 {
    if on_current_day {
        (i16::from(c) - i16::from(transition_hour)).rem_euclid(24) as u8
    } else {
        (c + 24 - transition_hour) % 24
    }
}
