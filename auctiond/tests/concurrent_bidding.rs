//! Concurrency: bids on the same entry serialize through its slot lock;
//! bids on disjoint entries proceed independently; the credit invariant
//! holds under contention.

use std::sync::Arc;
use std::thread;

use auctiond::{
    config::AppConfig,
    model::{Role, SlotRef},
    store::Store,
};
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

fn noon() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 15, 16, 0, 0).unwrap()
}

fn setup(users: &[&str]) -> (TempDir, Arc<Store>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = AppConfig {
        state_path: dir.path().join("state.json"),
        ..AppConfig::default()
    };
    let store = Store::open(cfg).expect("open store");
    store.bootstrap_admin("admin", "adminpw").expect("bootstrap");
    store.update_system_state(noon()).expect("populate calendar");
    for name in users {
        store
            .create_user("admin", name, "pw", Role::User, 0, 1000.0)
            .expect("create user");
    }
    (dir, Arc::new(store))
}

#[test]
fn contended_entry_prices_stay_linear() {
    let (_dir, store) = setup(&["u0", "u1", "u2", "u3"]);
    let target = SlotRef::new("2025-06-16", "2025-06-16T09:00", 0);

    let mut handles = Vec::new();
    for u in 0..4 {
        let store = Arc::clone(&store);
        let target = target.clone();
        handles.push(thread::spawn(move || {
            let name = format!("u{u}");
            for _ in 0..10 {
                store.place_bid(&name, &target, noon()).expect("bid");
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // 40 accepted bids, each exactly prior + 1.
    let grid = store.day_grid("u0", "2025-06-16", noon()).unwrap();
    let cell = grid
        .rows
        .iter()
        .find(|r| r.slot_key == "2025-06-16T09:00")
        .unwrap()
        .entries[0]
        .clone();
    assert_eq!(cell.price, 40);

    let bids = store.my_bids("u0", 100).unwrap();
    assert_eq!(bids.len(), 10);
}

#[test]
fn disjoint_entries_accept_parallel_bids() {
    let (_dir, store) = setup(&["solo"]);

    let mut handles = Vec::new();
    for gpu in 0..8u32 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            store
                .place_bid("solo", &SlotRef::new("2025-06-16", "2025-06-16T09:00", gpu), noon())
                .expect("bid");
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let owned = store.my_summary("solo").unwrap();
    assert_eq!(owned.len(), 8);
    let view = store.overview("solo", noon()).unwrap();
    assert_eq!(view.user.committed, 8);
}

#[test]
fn concurrent_bidders_never_overcommit() {
    let names: Vec<String> = (0..4).map(|i| format!("b{i}")).collect();
    let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
    let (_dir, store) = setup(&name_refs);
    // Tight balances force rejections under contention.
    for name in &names {
        store.set_balance("admin", name, 5.0).unwrap();
    }

    let mut handles = Vec::new();
    for name in &names {
        let store = Arc::clone(&store);
        let name = name.clone();
        handles.push(thread::spawn(move || {
            for hour in 9..21 {
                let slot = format!("2025-06-16T{hour:02}:00");
                let _ = store.place_bid(&name, &SlotRef::new("2025-06-16", slot, 0), noon());
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for name in &names {
        let view = store.overview(name, noon()).unwrap();
        assert!(
            view.user.committed <= view.user.balance,
            "{name} overcommitted: {} > {}",
            view.user.committed,
            view.user.balance
        );
    }
}
