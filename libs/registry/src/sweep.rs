//! Expiry sweep
//!
//! The sole path by which a crashed or unreachable instance leaves the
//! registry without an explicit unregister.

use crate::entry::ServiceEntry;
use crate::store::RegistryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
pub struct ExpirySweeper {
    store: Arc<RegistryStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: Arc<RegistryStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Evict every lapsed entry now
    pub fn sweep_once(&self) -> Vec<ServiceEntry> {
        let expired = self.store.remove_expired();
        if expired.is_empty() {
            debug!(live = self.store.len(), "Sweep found nothing to expire");
        } else {
            info!(
                expired = expired.len(),
                live = self.store.len(),
                "Sweep expired services"
            );
        }
        expired
    }

    /// Run the sweep on its own timer until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            info!(interval_ms = self.interval.as_millis() as u64, "Expiry sweep started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                }
            }
            info!("Expiry sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entry::ServiceDescriptor;

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweep_evicts_lapsed_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(RegistryStore::with_clock(
            Duration::from_secs(90),
            clock.clone(),
        ));
        store
            .insert(ServiceDescriptor::new(
                "Agent",
                "agent-1",
                "Agent",
                "tcp://127.0.0.1:7200",
                "1.0.0",
            ))
            .unwrap();

        let token = CancellationToken::new();
        let handle = ExpirySweeper::new(store.clone(), Duration::from_secs(15)).spawn(token.clone());

        clock.advance_secs(91);
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert!(store.snapshot().is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_sweep_once_keeps_live_entries() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(RegistryStore::with_clock(
            Duration::from_secs(90),
            clock.clone(),
        ));
        store
            .insert(ServiceDescriptor::new(
                "Agent",
                "agent-1",
                "Agent",
                "tcp://127.0.0.1:7200",
                "1.0.0",
            ))
            .unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(15));
        clock.advance_secs(89);
        assert!(sweeper.sweep_once().is_empty());
        clock.advance_secs(2);
        assert_eq!(sweeper.sweep_once().len(), 1);
    }
}
