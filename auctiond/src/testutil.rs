//! Shared helpers for unit tests.

use tempfile::TempDir;

use crate::calendar;
use crate::config::AppConfig;
use crate::model::{Day, DayStatus, Role, Slot, User};
use crate::store::Store;

/// Fresh store on a temp snapshot path, no accounts.
pub fn bare_store() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = AppConfig {
        state_path: dir.path().join("state.json"),
        monitor_token: Some("monitor-token".to_string()),
        ..AppConfig::default()
    };
    let store = Store::open(cfg).expect("open store");
    (dir, store)
}

/// Fresh store on a temp snapshot path, with a bootstrapped `admin` user
/// (password `adminpw`).
pub fn test_store() -> (TempDir, Store) {
    let (dir, store) = bare_store();
    store
        .bootstrap_admin("admin", "adminpw")
        .expect("bootstrap admin");
    (dir, store)
}

/// Insert a user directly, skipping the (slow) password derivation.
pub fn seed_user(store: &Store, username: &str, balance: f64, daily_budget: u64) {
    let mut state = store.state.lock();
    state.users.insert(
        username.to_string(),
        User {
            username: username.to_string(),
            password_salt: "00".to_string(),
            password_hash: "00".to_string(),
            role: Role::User,
            daily_budget,
            balance,
            enabled: true,
            last_login: None,
            outbid_notifications: Vec::new(),
        },
    );
}

pub fn seed_open_day(store: &Store, key: &str) {
    seed_day(store, key, DayStatus::Open);
}

/// Insert a day with its full 24-slot grid at the store's transition hour.
pub fn seed_day(store: &Store, key: &str, status: DayStatus) {
    let mut state = store.state.lock();
    let transition_hour = state.config.transition_hour;
    let slots = calendar::slot_keys_for_day(key, transition_hour)
        .expect("valid day key")
        .into_iter()
        .map(|k| (k, Slot::new()))
        .collect();
    state.days.insert(
        key.to_string(),
        Day {
            day_start: key.to_string(),
            status,
            finalized_at: None,
            slots,
        },
    );
}
