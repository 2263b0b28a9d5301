//! Registry store under concurrent registration, heartbeats, unregistration
//! and sweeps on a multi-threaded runtime.

use parking_lot::Mutex;
use registry::{
    ManualClock, RegistryError, RegistryStore, RemovalListener, RemovalReason, ServiceDescriptor,
    ServiceEntry, ServiceId,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::task::JoinSet;

const NAMES: [&str; 4] = ["audit-1", "audit-2", "analytics-1", "agent-1"];
const WORKERS: usize = 8;
const STEPS: usize = 200;
const ROUNDS: usize = 5;

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

fn setup() -> (Arc<RegistryStore>, Arc<ManualClock>, Arc<RemovedIds>) {
    let clock = Arc::new(ManualClock::starting_now());
    let store = Arc::new(RegistryStore::with_clock(
        Duration::from_secs(90),
        clock.clone(),
    ));
    let removed = Arc::new(RemovedIds::default());
    store.add_listener(removed.clone());
    (store, clock, removed)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_registration_admits_one_holder() {
    let (store, _, _) = setup();
    let barrier = Arc::new(Barrier::new(32));

    let mut tasks = JoinSet::new();
    for _ in 0..32 {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        tasks.spawn(async move {
            barrier.wait().await;
            store.insert(descriptor("audit-1"))
        });
    }

    let mut admitted = Vec::new();
    let mut conflicts = Vec::new();
    while let Some(result) = tasks.join_next().await {
        match result.unwrap() {
            Ok(entry) => admitted.push(entry.id),
            Err(RegistryError::Conflict { existing, .. }) => conflicts.push(existing),
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    assert_eq!(admitted.len(), 1);
    assert_eq!(conflicts.len(), 31);
    assert!(conflicts.iter().all(|id| *id == admitted[0]));
    assert_eq!(store.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_lifecycle_removes_each_id_once() {
    let (store, clock, removed) = setup();
    let issued = Arc::new(Mutex::new(Vec::<ServiceId>::new()));

    for _ in 0..ROUNDS {
        let mut tasks = JoinSet::new();

        for worker in 0..WORKERS {
            let store = Arc::clone(&store);
            let issued = Arc::clone(&issued);
            tasks.spawn(async move {
                for step in 0..STEPS {
                    let name = NAMES[(worker + step) % NAMES.len()];
                    match step % 4 {
                        0 => match store.insert(descriptor(name)) {
                            Ok(entry) => issued.lock().push(entry.id),
                            Err(RegistryError::Conflict { .. }) => {}
                            Err(e) => panic!("unexpected error {}", e),
                        },
                        1 => {
                            if let Some(entry) = store.lookup(name) {
                                let _ = store.touch(&entry.id);
                            }
                        }
                        2 => {
                            store.remove_expired();
                        }
                        _ => {
                            if worker % 2 == 0 {
                                if let Some(entry) = store.lookup(name) {
                                    let _ = store.remove(&entry.id);
                                }
                            }
                        }
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        // Published snapshots never hold two entries under one name
        {
            let store = Arc::clone(&store);
            tasks.spawn(async move {
                for _ in 0..STEPS {
                    let snapshot = store.snapshot();
                    let mut names = HashSet::new();
                    for entry in snapshot.entries() {
                        assert!(
                            names.insert(entry.unique_name.clone()),
                            "two entries hold {}",
                            entry.unique_name
                        );
                    }
                    tokio::task::yield_now().await;
                }
            });
        }

        // Entries lapse mid-round so touch, insert and sweep all race on expiry
        {
            let clock = Arc::clone(&clock);
            tasks.spawn(async move {
                for _ in 0..10 {
                    clock.advance_secs(20);
                    tokio::task::yield_now().await;
                }
            });
        }

        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    }

    clock.advance_secs(91);
    store.remove_expired();
    assert!(store.is_empty());

    let removed = removed.0.lock();
    let snapshot = store.snapshot();
    let mut seen = HashSet::new();
    for (id, _) in removed.iter() {
        assert!(seen.insert(*id), "{} reported removed twice", id);
        assert!(!snapshot.contains(id));
    }

    let issued = issued.lock();
    assert!(!issued.is_empty());
    assert_eq!(seen.len(), issued.len());
    assert!(issued.iter().all(|id| seen.contains(id)));
}
