//! Day rollover scenarios: charging, budgets, window maintenance, catch-up.

use auctiond::{
    config::AppConfig,
    model::{Role, SlotRef},
    store::Store,
};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

// Noon EDT on the first executing day; its close is 2025-06-16T03:59:59Z.
fn noon() -> DateTime<Utc> {
    utc(2025, 6, 15, 16, 0, 0)
}

fn setup() -> (TempDir, Store) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = AppConfig {
        state_path: dir.path().join("state.json"),
        ..AppConfig::default()
    };
    let store = Store::open(cfg).expect("open store");
    store.bootstrap_admin("admin", "adminpw").expect("bootstrap");
    store.update_system_state(noon()).expect("populate calendar");
    (dir, store)
}

fn add_user(store: &Store, name: &str, balance: f64, budget: u64) {
    store
        .create_user("admin", name, "pw", Role::User, budget, balance)
        .expect("create user");
}

fn bid_to_price(store: &Store, user: &str, target: &SlotRef, price: u64) {
    for _ in 0..price {
        store.place_bid(user, target, noon()).expect("bid");
    }
}

#[test]
fn rollover_finalizes_charges_and_extends_the_window() {
    let (_dir, store) = setup();
    add_user(&store, "u1", 100.0, 11);
    add_user(&store, "u2", 100.0, 13);

    bid_to_price(&store, "u1", &SlotRef::new("2025-06-16", "2025-06-16T10:00", 0), 4);
    bid_to_price(&store, "u2", &SlotRef::new("2025-06-16", "2025-06-16T11:00", 1), 7);

    // One second past the executing day's close.
    store.update_system_state(utc(2025, 6, 16, 4, 0, 0)).unwrap();

    let view = store.overview("u1", noon()).unwrap();
    assert_eq!(view.days[0].day_key, "2025-06-16");
    assert_eq!(view.days[0].status, "executing");
    let open: Vec<&str> = view.days[1..].iter().map(|d| d.day_key.as_str()).collect();
    assert_eq!(
        open,
        vec!["2025-06-17", "2025-06-18", "2025-06-19", "2025-06-20", "2025-06-21", "2025-06-22"]
    );

    // Balances: charged for the promoted day, then budgeted.
    assert_eq!(view.user.balance, 100 - 4 + 11);
    let view2 = store.overview("u2", noon()).unwrap();
    assert_eq!(view2.user.balance, 100 - 7 + 13);

    // Yesterday is history now.
    assert_eq!(store.history_days(), vec!["2025-06-15".to_string()]);
    let grid = store.history_day("u1", "2025-06-15", noon()).unwrap();
    assert_eq!(grid.status, "final");

    // Commitments moved out of the open window with the promotion.
    assert_eq!(view.user.committed, 0);
}

#[test]
fn promoted_winnings_survive_as_executing_day_ownership() {
    let (_dir, store) = setup();
    add_user(&store, "u1", 100.0, 0);

    bid_to_price(&store, "u1", &SlotRef::new("2025-06-16", "2025-06-16T10:00", 2), 3);
    store.update_system_state(utc(2025, 6, 16, 4, 0, 0)).unwrap();

    let owned = store.my_summary("u1").unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].day_status, "executing");
    assert_eq!(owned[0].price, 3);
}

#[test]
fn double_update_with_the_same_clock_changes_nothing() {
    let (_dir, store) = setup();
    add_user(&store, "u1", 50.0, 9);
    bid_to_price(&store, "u1", &SlotRef::new("2025-06-16", "2025-06-16T10:00", 0), 2);

    let advance_at = utc(2025, 6, 16, 4, 0, 0);
    store.update_system_state(advance_at).unwrap();
    let first = serde_json::to_string(&store.overview("u1", advance_at).unwrap()).unwrap();

    store.update_system_state(advance_at).unwrap();
    let second = serde_json::to_string(&store.overview("u1", advance_at).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn catch_up_after_downtime_is_bounded_per_call() {
    let (_dir, store) = setup();
    add_user(&store, "u1", 0.0, 1);

    // Thirteen days of downtime: the first call advances ten days at most.
    let later = utc(2025, 6, 28, 16, 0, 0);
    store.update_system_state(later).unwrap();
    let view = store.overview("u1", later).unwrap();
    assert_eq!(view.days[0].day_key, "2025-06-25");
    assert_eq!(view.user.balance, 10);

    // The eleventh day needs another call.
    store.update_system_state(later).unwrap();
    let view = store.overview("u1", later).unwrap();
    assert_eq!(view.days[0].day_key, "2025-06-28");
    assert_eq!(view.days.len(), 7);
    assert_eq!(view.user.balance, 13);
}

#[test]
fn unused_credit_accumulates_across_days() {
    let (_dir, store) = setup();
    add_user(&store, "saver", 5.0, 10);

    store.update_system_state(utc(2025, 6, 16, 4, 0, 0)).unwrap();
    store.update_system_state(utc(2025, 6, 17, 4, 0, 0)).unwrap();

    // No cap: 5 + 10 + 10.
    let view = store.overview("saver", noon()).unwrap();
    assert_eq!(view.user.balance, 25);
}
