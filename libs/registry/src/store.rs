//! Registry Store
//!
//! Holds the set of live service entries. Every mutation (register,
//! heartbeat, unregister, expiry) runs under one mutex so a heartbeat can
//! never race an expiry removal for the same entry. After each mutation an
//! immutable [`RegistrySnapshot`] is published; routing reads clone the
//! snapshot `Arc` and never wait on registry churn.
//!
//! Liveness is judged against the injected [`Clock`] on every read, so an
//! entry whose heartbeat window has lapsed is invisible even before the
//! sweep physically removes it.
//!
//! Removal listeners run synchronously on the removing call, after the new
//! snapshot is visible and outside the store lock.

use crate::clock::{Clock, SystemClock};
use crate::entry::{ServiceDescriptor, ServiceEntry, ServiceId};
use crate::error::{RegistryError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Why an entry left the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicit unregister
    Unregistered,
    /// Heartbeat window lapsed
    Expired,
}

/// Notified synchronously whenever an entry is removed
pub trait RemovalListener: Send + Sync {
    fn on_removed(&self, entry: &ServiceEntry, reason: RemovalReason);
}

/// Immutable view of the store at one version
#[derive(Debug, Default, Clone)]
pub struct RegistrySnapshot {
    version: u64,
    entries: HashMap<ServiceId, ServiceEntry>,
    by_unique: HashMap<String, ServiceId>,
}

impl RegistrySnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, id: &ServiceId) -> Option<&ServiceEntry> {
        self.entries.get(id)
    }

    pub fn lookup(&self, unique_name: &str) -> Option<&ServiceEntry> {
        self.by_unique
            .get(unique_name)
            .and_then(|id| self.entries.get(id))
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Default)]
struct StoreState {
    version: u64,
    entries: HashMap<ServiceId, ServiceEntry>,
    by_unique: HashMap<String, ServiceId>,
}

impl StoreState {
    fn insert(&mut self, entry: ServiceEntry) {
        self.by_unique.insert(entry.unique_name.clone(), entry.id);
        self.entries.insert(entry.id, entry);
    }

    fn remove(&mut self, id: &ServiceId) -> Option<ServiceEntry> {
        let entry = self.entries.remove(id)?;
        if self.by_unique.get(&entry.unique_name) == Some(id) {
            self.by_unique.remove(&entry.unique_name);
        }
        Some(entry)
    }

    fn snapshot(&mut self) -> Arc<RegistrySnapshot> {
        self.version += 1;
        Arc::new(RegistrySnapshot {
            version: self.version,
            entries: self.entries.clone(),
            by_unique: self.by_unique.clone(),
        })
    }
}

/// Concurrency-safe set of live service entries
pub struct RegistryStore {
    state: Mutex<StoreState>,
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    listeners: RwLock<Vec<Arc<dyn RemovalListener>>>,
    clock: Arc<dyn Clock>,
    expiry_window: chrono::Duration,
}

impl fmt::Debug for RegistryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryStore")
            .field("entries", &self.snapshot.read().len())
            .field("expiry_window", &self.expiry_window)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RegistryStore {
    /// Store judged against the wall clock
    pub fn new(expiry_window: Duration) -> Self {
        Self::with_clock(expiry_window, Arc::new(SystemClock))
    }

    pub fn with_clock(expiry_window: Duration, clock: Arc<dyn Clock>) -> Self {
        let expiry_window =
            chrono::Duration::from_std(expiry_window)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::default())),
            listeners: RwLock::new(Vec::new()),
            clock,
            expiry_window,
        }
    }

    pub fn expiry_window(&self) -> chrono::Duration {
        self.expiry_window
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribe to removals
    pub fn add_listener(&self, listener: Arc<dyn RemovalListener>) {
        self.listeners.write().push(listener);
    }

    /// Whether `entry` is still inside its heartbeat window
    pub fn is_live(&self, entry: &ServiceEntry) -> bool {
        entry.is_live_at(self.clock.now(), self.expiry_window)
    }

    /// Insert a new entry for `descriptor`
    ///
    /// Fails with `Conflict` while another live entry holds the same unique
    /// name. A lapsed holder is evicted first and reported as expired.
    pub fn insert(&self, descriptor: ServiceDescriptor) -> Result<ServiceEntry> {
        descriptor.validate()?;

        let mut evicted = None;
        let entry = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            if let Some(existing_id) = state.by_unique.get(&descriptor.unique_name).copied() {
                let existing = &state.entries[&existing_id];
                if existing.is_live_at(now, self.expiry_window) {
                    return Err(RegistryError::Conflict {
                        unique_name: descriptor.unique_name,
                        existing: existing_id,
                    });
                }
                evicted = state.remove(&existing_id);
            }

            let entry = ServiceEntry::from_descriptor(descriptor, now);
            state.insert(entry.clone());
            self.publish(&mut state);
            entry
        };

        if let Some(old) = evicted {
            self.notify_removed(&old, RemovalReason::Expired);
        }

        info!(
            service_id = %entry.id,
            unique_name = %entry.unique_name,
            service_type = %entry.service_type,
            url = %entry.url,
            "Service registered"
        );
        Ok(entry)
    }

    /// Refresh the heartbeat of a live entry
    ///
    /// An entry found past its window is removed on the spot and the call
    /// fails with `NotFound`, the same outcome the sweep would have produced.
    pub fn touch(&self, id: &ServiceId) -> Result<ServiceEntry> {
        let outcome = {
            let mut state = self.state.lock();
            let now = self.clock.now();

            let live = match state.entries.get(id) {
                Some(entry) => entry.is_live_at(now, self.expiry_window),
                None => return Err(RegistryError::not_found(id)),
            };

            if live {
                let entry = match state.entries.get_mut(id) {
                    Some(entry) => {
                        entry.last_heartbeat = now;
                        entry.clone()
                    }
                    None => return Err(RegistryError::not_found(id)),
                };
                self.publish(&mut state);
                Ok(entry)
            } else {
                let expired = state.remove(id);
                self.publish(&mut state);
                Err(expired)
            }
        };

        match outcome {
            Ok(entry) => {
                debug!(service_id = %id, "Heartbeat accepted");
                Ok(entry)
            }
            Err(expired) => {
                if let Some(entry) = expired {
                    info!(
                        service_id = %id,
                        unique_name = %entry.unique_name,
                        "Heartbeat arrived after expiry, entry dropped"
                    );
                    self.notify_removed(&entry, RemovalReason::Expired);
                }
                Err(RegistryError::not_found(id))
            }
        }
    }

    /// Remove an entry explicitly
    pub fn remove(&self, id: &ServiceId) -> Result<ServiceEntry> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.remove(id).ok_or_else(|| RegistryError::not_found(id))?;
            self.publish(&mut state);
            entry
        };

        info!(
            service_id = %id,
            unique_name = %entry.unique_name,
            "Service unregistered"
        );
        self.notify_removed(&entry, RemovalReason::Unregistered);
        Ok(entry)
    }

    /// Remove every entry whose heartbeat window has lapsed
    pub fn remove_expired(&self) -> Vec<ServiceEntry> {
        let expired = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            let ids: Vec<ServiceId> = state
                .entries
                .values()
                .filter(|e| !e.is_live_at(now, self.expiry_window))
                .map(|e| e.id)
                .collect();

            if ids.is_empty() {
                return Vec::new();
            }

            let expired: Vec<ServiceEntry> =
                ids.iter().filter_map(|id| state.remove(id)).collect();
            self.publish(&mut state);
            expired
        };

        for entry in &expired {
            info!(
                service_id = %entry.id,
                unique_name = %entry.unique_name,
                last_heartbeat = %entry.last_heartbeat,
                "Service expired"
            );
            self.notify_removed(entry, RemovalReason::Expired);
        }
        expired
    }

    /// Latest published snapshot, including lapsed-but-unswept entries
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Live entry by id
    pub fn get(&self, id: &ServiceId) -> Option<ServiceEntry> {
        self.snapshot()
            .get(id)
            .filter(|e| self.is_live(e))
            .cloned()
    }

    /// Live entry by unique name
    pub fn lookup(&self, unique_name: &str) -> Option<ServiceEntry> {
        self.snapshot()
            .lookup(unique_name)
            .filter(|e| self.is_live(e))
            .cloned()
    }

    /// Live entries of one service type, ordered by unique name
    pub fn by_type(&self, service_type: &str) -> Vec<ServiceEntry> {
        let now = self.clock.now();
        let snapshot = self.snapshot();
        let mut entries: Vec<ServiceEntry> = snapshot
            .entries()
            .filter(|e| e.service_type == service_type)
            .filter(|e| e.is_live_at(now, self.expiry_window))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.unique_name.cmp(&b.unique_name));
        entries
    }

    /// Every live entry, ordered by unique name
    pub fn live_entries(&self) -> Vec<ServiceEntry> {
        let now = self.clock.now();
        let snapshot = self.snapshot();
        let mut entries: Vec<ServiceEntry> = snapshot
            .entries()
            .filter(|e| e.is_live_at(now, self.expiry_window))
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.unique_name.cmp(&b.unique_name));
        entries
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.snapshot()
            .entries()
            .filter(|e| e.is_live_at(now, self.expiry_window))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, state: &mut StoreState) {
        *self.snapshot.write() = state.snapshot();
    }

    fn notify_removed(&self, entry: &ServiceEntry, reason: RemovalReason) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_removed(entry, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    struct RecordingListener {
        removed: Mutex<Vec<(String, RemovalReason)>>,
    }

    impl RemovalListener for RecordingListener {
        fn on_removed(&self, entry: &ServiceEntry, reason: RemovalReason) {
            self.removed.lock().push((entry.unique_name.clone(), reason));
        }
    }

    fn store() -> (RegistryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = RegistryStore::with_clock(Duration::from_secs(90), clock.clone());
        (store, clock)
    }

    fn audit(unique: &str) -> ServiceDescriptor {
        ServiceDescriptor::new("Audit", unique, "Audit", "tcp://127.0.0.1:7001", "1.0.0")
    }

    #[test]
    fn test_insert_and_lookup() {
        let (store, _) = store();
        let entry = store.insert(audit("audit-1")).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("audit-1").unwrap().id, entry.id);
        assert_eq!(store.get(&entry.id).unwrap().unique_name, "audit-1");
        assert_eq!(store.by_type("Audit").len(), 1);
        assert!(store.by_type("Analytics").is_empty());
    }

    #[test]
    fn test_duplicate_live_unique_name_conflicts() {
        let (store, _) = store();
        let first = store.insert(audit("audit-1")).unwrap();

        let err = store.insert(audit("audit-1")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                unique_name: "audit-1".to_string(),
                existing: first.id,
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lapsed_holder_is_replaced() {
        let (store, clock) = store();
        let listener = Arc::new(RecordingListener {
            removed: Mutex::new(Vec::new()),
        });
        store.add_listener(listener.clone());

        let first = store.insert(audit("audit-1")).unwrap();
        clock.advance_secs(91);
        let second = store.insert(audit("audit-1")).unwrap();

        assert_ne!(first.id, second.id);
        assert!(store.get(&first.id).is_none());
        assert_eq!(
            listener.removed.lock().as_slice(),
            &[("audit-1".to_string(), RemovalReason::Expired)]
        );
    }

    #[test]
    fn test_touch_extends_liveness() {
        let (store, clock) = store();
        let entry = store.insert(audit("audit-1")).unwrap();

        clock.advance_secs(60);
        store.touch(&entry.id).unwrap();
        clock.advance_secs(60);

        assert!(store.get(&entry.id).is_some());
        assert!(store.remove_expired().is_empty());
    }

    #[test]
    fn test_touch_after_expiry_is_not_found() {
        let (store, clock) = store();
        let entry = store.insert(audit("audit-1")).unwrap();

        clock.advance_secs(91);
        let err = store.touch(&entry.id).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_lapsed_entries_hidden_before_sweep() {
        let (store, clock) = store();
        store.insert(audit("audit-1")).unwrap();
        clock.advance_secs(91);

        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.len(), 0);
        assert!(store.lookup("audit-1").is_none());
        assert!(store.by_type("Audit").is_empty());
    }

    #[test]
    fn test_remove_expired_notifies_listeners() {
        let (store, clock) = store();
        let listener = Arc::new(RecordingListener {
            removed: Mutex::new(Vec::new()),
        });
        store.add_listener(listener.clone());

        store.insert(audit("audit-1")).unwrap();
        clock.advance_secs(30);
        store.insert(audit("audit-2")).unwrap();
        clock.advance_secs(61);

        let expired = store.remove_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].unique_name, "audit-1");
        assert_eq!(store.len(), 1);
        assert_eq!(listener.removed.lock().len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let (store, _) = store();
        let entry = store.insert(audit("audit-1")).unwrap();

        store.remove(&entry.id).unwrap();
        assert!(store.remove(&entry.id).unwrap_err().is_not_found());
    }

    #[test]
    fn test_snapshot_version_advances() {
        let (store, _) = store();
        let v0 = store.snapshot().version();
        let entry = store.insert(audit("audit-1")).unwrap();
        let v1 = store.snapshot().version();
        store.touch(&entry.id).unwrap();
        let v2 = store.snapshot().version();

        assert!(v0 < v1 && v1 < v2);
    }
}
