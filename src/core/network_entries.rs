//! Network entry monitoring.
//!
//! A network entry is a `(interface name, IPv4 address)` pair usable for
//! multicast discovery. The monitor rescans the OS interface list every 30
//! seconds and publishes the current set through a watch channel whenever it
//! differs from the previous one. The absence of entries is itself the
//! signal: no errors are reported.

use crate::core::config::ENTRIES_UPDATE_INTERVAL;
use crate::utils::sos::SignalOfStop;
use std::net::Ipv4Addr;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// One usable pair of interface and IPv4 unicast address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEntry {
    pub interface: String,
    pub ipv4: Ipv4Addr,
}

impl NetworkEntry {
    pub fn label(&self) -> String {
        format!("{} ({})", self.interface, self.ipv4)
    }
}

/// An address is eligible as a multicast source when it is a real unicast
/// IPv4 address.
fn valid_host_address(addr: Ipv4Addr) -> bool {
    !addr.is_unspecified() && !addr.is_loopback() && !addr.is_multicast()
}

/// Scan the OS interface list and collect the eligible entries.
pub fn build_entries() -> Vec<NetworkEntry> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!(event = "interface_scan_failure", error = %e, "Failed to enumerate network interfaces");
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(ref v4) if valid_host_address(v4.ip) => Some(NetworkEntry {
                interface: iface.name.clone(),
                ipv4: v4.ip,
            }),
            _ => None,
        })
        .collect()
}

/// Handle to the monitor task.
#[derive(Debug, Clone)]
pub struct EntriesMonitor {
    entries: watch::Receiver<Vec<NetworkEntry>>,
    refresh: mpsc::Sender<()>,
}

impl EntriesMonitor {
    /// Spawn the monitor task. The initial scan happens before returning so
    /// consumers always observe a populated watch value.
    pub fn spawn(sos: SignalOfStop) -> Self {
        let initial = build_entries();
        for entry in &initial {
            info!(event = "network_entry_detected", entry = %entry.label(), "Detected network entry");
        }
        if initial.is_empty() {
            warn!(event = "no_network_entries", "No valid network entry detected");
        }

        let (entries_tx, entries_rx) = watch::channel(initial);
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(4);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ENTRIES_UPDATE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    poke = refresh_rx.recv() => {
                        if poke.is_none() {
                            return;
                        }
                    }
                    _ = sos.wait() => return,
                }

                let current = build_entries();
                let changed = *entries_tx.borrow() != current;
                if changed {
                    for entry in &current {
                        info!(event = "network_entry_detected", entry = %entry.label(), "Detected network entry");
                    }
                    if current.is_empty() {
                        warn!(event = "no_network_entries", "No valid network entry detected");
                    }
                    if entries_tx.send(current).is_err() {
                        return;
                    }
                }
            }
        });

        Self {
            entries: entries_rx,
            refresh: refresh_tx,
        }
    }

    /// The current set of entries.
    pub fn entries(&self) -> Vec<NetworkEntry> {
        self.entries.borrow().clone()
    }

    /// A receiver to await changes on.
    pub fn subscribe(&self) -> watch::Receiver<Vec<NetworkEntry>> {
        self.entries.clone()
    }

    /// Force an out-of-schedule rescan (used after discovery send errors).
    pub async fn refresh(&self) {
        let _ = self.refresh.send(()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_host_address() {
        assert!(valid_host_address(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(!valid_host_address(Ipv4Addr::UNSPECIFIED));
        assert!(!valid_host_address(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!valid_host_address(Ipv4Addr::new(239, 255, 101, 10)));
    }

    #[test]
    fn test_build_entries_excludes_loopback() {
        for entry in build_entries() {
            assert!(!entry.ipv4.is_loopback());
            assert!(!entry.ipv4.is_multicast());
        }
    }
}
