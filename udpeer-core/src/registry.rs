//! Device registry: peers discovered through heartbeats, keyed by name, with liveness expiry.
//!
//! Time is passed in by the caller so the registry stays free of clocks and sleeps.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub addr: SocketAddr,
    pub last_heartbeat: Instant,
}

impl Device {
    /// Time since the last heartbeat, as of `now`.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }
}

/// Result of recording a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerUpdate {
    /// First heartbeat from this name.
    New,
    /// Known peer; address and timestamp refreshed.
    Refreshed,
    /// Our own heartbeat echoed back by the broadcast; not recorded.
    Ignored,
}

pub struct DeviceRegistry {
    local_name: String,
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            devices: HashMap::new(),
        }
    }

    /// Insert or refresh a device from a heartbeat received at `now`.
    pub fn upsert(&mut self, name: &str, addr: SocketAddr, now: Instant) -> PeerUpdate {
        if name == self.local_name {
            return PeerUpdate::Ignored;
        }
        let device = Device {
            name: name.to_string(),
            addr,
            last_heartbeat: now,
        };
        match self.devices.insert(name.to_string(), device) {
            Some(_) => PeerUpdate::Refreshed,
            None => PeerUpdate::New,
        }
    }

    pub fn get(&self, name: &str) -> Option<Device> {
        self.devices.get(name).cloned()
    }

    /// Owned copy of all devices, sorted by name.
    pub fn snapshot(&self) -> Vec<Device> {
        let mut out: Vec<Device> = self.devices.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Remove every device silent for longer than `threshold`. Returns the removed devices.
    pub fn sweep_expired(&mut self, now: Instant, threshold: Duration) -> Vec<Device> {
        let expired: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.silence(now) > threshold)
            .map(|d| d.name.clone())
            .collect();
        let mut removed: Vec<Device> = expired
            .iter()
            .filter_map(|name| self.devices.remove(name))
            .collect();
        removed.sort_by(|a, b| a.name.cmp(&b.name));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{DEVICE_TIMEOUT, HEARTBEAT_INTERVAL};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], port))
    }

    #[test]
    fn first_heartbeat_is_new_then_refreshed() {
        let mut reg = DeviceRegistry::new("me");
        let t0 = Instant::now();
        assert_eq!(reg.upsert("alice", addr(5000), t0), PeerUpdate::New);
        assert_eq!(reg.upsert("alice", addr(5000), t0), PeerUpdate::Refreshed);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn own_name_never_recorded() {
        let mut reg = DeviceRegistry::new("me");
        assert_eq!(
            reg.upsert("me", addr(5000), Instant::now()),
            PeerUpdate::Ignored
        );
        assert!(reg.is_empty());
        assert!(reg.get("me").is_none());
    }

    #[test]
    fn latest_heartbeat_wins() {
        let mut reg = DeviceRegistry::new("me");
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);
        reg.upsert("alice", addr(5000), t0);
        reg.upsert("alice", addr(6000), t1);
        let d = reg.get("alice").unwrap();
        assert_eq!(d.addr, addr(6000));
        assert_eq!(d.last_heartbeat, t1);
    }

    #[test]
    fn sweep_removes_only_silent_devices() {
        let mut reg = DeviceRegistry::new("me");
        let t0 = Instant::now();
        reg.upsert("alice", addr(5000), t0);
        reg.upsert("bob", addr(5001), t0 + Duration::from_secs(8));

        // Exactly at the threshold the device is kept.
        let removed = reg.sweep_expired(t0 + DEVICE_TIMEOUT, DEVICE_TIMEOUT);
        assert!(removed.is_empty());

        // Next tick: alice has been silent for 15s, bob for 7s.
        let removed = reg.sweep_expired(t0 + DEVICE_TIMEOUT + HEARTBEAT_INTERVAL, DEVICE_TIMEOUT);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].name, "alice");
        assert!(reg.get("alice").is_none());
        assert!(reg.get("bob").is_some());
    }

    #[test]
    fn snapshot_sorted_by_name() {
        let mut reg = DeviceRegistry::new("me");
        let now = Instant::now();
        reg.upsert("carol", addr(1), now);
        reg.upsert("alice", addr(2), now);
        reg.upsert("bob", addr(3), now);
        let names: Vec<String> = reg.snapshot().into_iter().map(|d| d.name).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
    }
}
