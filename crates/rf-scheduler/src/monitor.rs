//! Host capability monitors
//!
//! Network reachability and charging state are host facts the scheduler only
//! observes. Both are exposed as `watch` channels so constraint waits wake
//! exactly when the state changes. The `Static*` implementations double as
//! test fixtures and as defaults for hosts that do not report these signals.

use tokio::sync::watch;

use crate::job::Reachability;

/// Current route to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkStatus {
    Offline,
    Cellular,
    Wifi,
}

impl NetworkStatus {
    /// Whether this status meets a job's `internet(atLeast:)` requirement.
    pub fn satisfies(&self, required: Reachability) -> bool {
        match required {
            Reachability::Any => *self != NetworkStatus::Offline,
            Reachability::Cellular => *self >= NetworkStatus::Cellular,
            Reachability::Wifi => *self == NetworkStatus::Wifi,
        }
    }
}

/// Source of reachability updates.
pub trait NetworkMonitor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

/// Manually driven monitor.
pub struct StaticNetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl StaticNetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Monitor that always reports Wi-Fi; the default for hosts without a
    /// reachability signal.
    pub fn online() -> Self {
        Self::new(NetworkStatus::Wifi)
    }

    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_replace(status);
    }
}

impl NetworkMonitor for StaticNetworkMonitor {
    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Source of charging-state updates; `true` means on AC power.
pub trait PowerMonitor: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Manually driven power monitor.
pub struct StaticPowerMonitor {
    tx: watch::Sender<bool>,
}

impl StaticPowerMonitor {
    pub fn new(charging: bool) -> Self {
        let (tx, _rx) = watch::channel(charging);
        Self { tx }
    }

    /// Monitor that always reports AC power.
    pub fn plugged_in() -> Self {
        Self::new(true)
    }

    pub fn set(&self, charging: bool) {
        self.tx.send_replace(charging);
    }
}

impl PowerMonitor for StaticPowerMonitor {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_matrix() {
        let offline = NetworkStatus::Offline;
        let cellular = NetworkStatus::Cellular;
        let wifi = NetworkStatus::Wifi;

        assert!(!offline.satisfies(Reachability::Any));
        assert!(!offline.satisfies(Reachability::Cellular));
        assert!(!offline.satisfies(Reachability::Wifi));

        assert!(cellular.satisfies(Reachability::Any));
        assert!(cellular.satisfies(Reachability::Cellular));
        assert!(!cellular.satisfies(Reachability::Wifi));

        assert!(wifi.satisfies(Reachability::Any));
        assert!(wifi.satisfies(Reachability::Cellular));
        assert!(wifi.satisfies(Reachability::Wifi));
    }

    #[tokio::test]
    async fn test_static_monitor_broadcasts_changes() {
        let monitor = StaticNetworkMonitor::new(NetworkStatus::Offline);
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), NetworkStatus::Offline);

        monitor.set(NetworkStatus::Wifi);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Wifi);
    }
}
