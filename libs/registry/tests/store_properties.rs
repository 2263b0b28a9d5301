//! Registry Store Property Tests
//!
//! Random sequences of register / heartbeat / unregister / clock advance /
//! sweep, checked after every step against the invariants the router relies
//! on.

use parking_lot::Mutex;
use proptest::prelude::*;
use registry::{
    Clock, ManualClock, RegistryError, RegistryStore, RemovalListener, RemovalReason,
    ServiceDescriptor, ServiceEntry, ServiceId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const WINDOW_SECS: i64 = 90;
const NAMES: [&str; 4] = ["audit-1", "audit-2", "analytics-1", "agent-1"];

#[derive(Debug, Clone)]
enum Op {
    Register(usize),
    Heartbeat(usize),
    Unregister(usize),
    Advance(i64),
    Sweep,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES.len()).prop_map(Op::Register),
        (0..16usize).prop_map(Op::Heartbeat),
        (0..16usize).prop_map(Op::Unregister),
        (0..60i64).prop_map(Op::Advance),
        Just(Op::Sweep),
    ]
}

#[derive(Default)]
struct RemovedIds(Mutex<Vec<(ServiceId, RemovalReason)>>);

impl RemovalListener for RemovedIds {
    fn on_removed(&self, entry: &ServiceEntry, reason: RemovalReason) {
        self.0.lock().push((entry.id, reason));
    }
}

fn descriptor(unique: &str) -> ServiceDescriptor {
    ServiceDescriptor::new("Audit", unique, "Audit", "tcp://127.0.0.1:7000", "1.0.0")
}

proptest! {
    #[test]
    fn registry_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = RegistryStore::with_clock(Duration::from_secs(WINDOW_SECS as u64), clock.clone());
        let removed = Arc::new(RemovedIds::default());
        store.add_listener(removed.clone());

        let mut issued: Vec<ServiceId> = Vec::new();
        let mut dead: HashSet<ServiceId> = HashSet::new();

        for op in ops {
            match op {
                Op::Register(n) => {
                    let name = NAMES[n];
                    let holder = store.lookup(name);
                    match store.insert(descriptor(name)) {
                        Ok(entry) => {
                            prop_assert!(holder.is_none());
                            prop_assert!(!issued.contains(&entry.id));
                            issued.push(entry.id);
                        }
                        Err(RegistryError::Conflict { existing, .. }) => {
                            prop_assert_eq!(holder.map(|e| e.id), Some(existing));
                        }
                        Err(e) => prop_assert!(false, "unexpected error {}", e),
                    }
                }
                Op::Heartbeat(i) => {
                    if let Some(id) = issued.get(i).copied() {
                        let was_live = store.get(&id).is_some();
                        match store.touch(&id) {
                            Ok(_) => prop_assert!(was_live),
                            Err(e) => {
                                prop_assert!(e.is_not_found());
                                prop_assert!(!was_live);
                                dead.insert(id);
                            }
                        }
                    }
                }
                Op::Unregister(i) => {
                    if let Some(id) = issued.get(i).copied() {
                        if store.remove(&id).is_err() {
                            prop_assert!(store.snapshot().get(&id).is_none());
                        }
                        dead.insert(id);
                    }
                }
                Op::Advance(secs) => clock.advance_secs(secs),
                Op::Sweep => {
                    for entry in store.remove_expired() {
                        dead.insert(entry.id);
                    }
                }
            }

            let now = clock.now();
            let live = store.live_entries();

            let names: HashSet<&str> = live.iter().map(|e| e.unique_name.as_str()).collect();
            prop_assert_eq!(names.len(), live.len());

            for entry in &live {
                prop_assert!(now - entry.last_heartbeat <= chrono::Duration::seconds(WINDOW_SECS));
                prop_assert!(!dead.contains(&entry.id));
            }

            for id in &dead {
                prop_assert!(store.get(id).is_none());
                prop_assert!(store.snapshot().get(id).is_none());
            }
        }

        let notified: HashSet<ServiceId> = removed.0.lock().iter().map(|(id, _)| *id).collect();
        for id in &dead {
            prop_assert!(notified.contains(id));
        }
    }
}

#[test]
fn test_removal_reasons_reported() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = RegistryStore::with_clock(Duration::from_secs(90), clock.clone());
    let removed = Arc::new(RemovedIds::default());
    store.add_listener(removed.clone());

    let a = store.insert(descriptor("audit-1")).unwrap();
    let b = store.insert(descriptor("audit-2")).unwrap();

    store.remove(&a.id).unwrap();
    clock.advance_secs(91);
    store.remove_expired();

    let events = removed.0.lock().clone();
    assert_eq!(
        events,
        vec![
            (a.id, RemovalReason::Unregistered),
            (b.id, RemovalReason::Expired)
        ]
    );
}
