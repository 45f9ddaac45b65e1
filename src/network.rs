//! Connectivity signal.
//!
//! A pure signal source: the embedding application feeds it the platform's
//! online/offline transitions and everything else subscribes. The signal is
//! eventually accurate, not authoritative: a positive reading never
//! guarantees that a given remote call will succeed, which is why the data
//! service still falls back on network-class failures.

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// A monitor starting in the given state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn set_online(&self) {
        self.set(true);
    }

    pub fn set_offline(&self) {
        self.set(false);
    }

    fn set(&self, online: bool) {
        // send_if_modified so flickerless duplicates don't wake subscribers.
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
    }

    /// Receiver that observes every online/offline transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
