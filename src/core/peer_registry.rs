//! The peer registry.
//!
//! Holds one record per user ever seen on the LAN. Records are refreshed by
//! discovery beacons and age out after `AGE_MAX` silent ticks; an aged-out
//! record becomes Unconfirmed but is retained so per-peer reception policies
//! survive. The whole registry is persisted to `<conf>/peers.json` on change
//! and at shutdown; persisted records always come back Unconfirmed until a
//! fresh beacon is received.

use crate::core::config::AGE_MAX;
use crate::core::discovery::beacon::{Beacon, HASH_LEN};
use crate::core::icon::{self, UserIcon};
use crate::core::identity::{ANONYMOUS_UUID, NO_NAME};
use crate::core::reception::ReceptionPolicy;
use crate::utils::atomic_write::atomic_write;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ── Peer record ──────────────────────────────────────────────────────────────

/// Freshness of a peer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAge {
    /// Number of aging ticks since the last beacon (0..=AGE_MAX).
    Ticks(u8),
    /// No recent beacon: the peer is not currently reachable.
    Unconfirmed,
}

/// One known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub uuid: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub ipv4: Ipv4Addr,
    pub ft_port: u16,
    pub it_port: u16,
    pub icon: Option<UserIcon>,
    pub age: PeerAge,
    /// Per-peer reception policy; `None` defers to the local default.
    pub policy_override: Option<ReceptionPolicy>,
}

impl PeerRecord {
    /// Whether a recent beacon confirms this peer is reachable.
    pub fn active(&self) -> bool {
        matches!(self.age, PeerAge::Ticks(_))
    }

    /// First and last name joined for display and destination folders.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// The synthetic record standing in for an unidentified sender.
    pub fn anonymous() -> Self {
        Self {
            uuid: ANONYMOUS_UUID,
            first_name: "Anonymous".to_string(),
            last_name: String::new(),
            ipv4: Ipv4Addr::UNSPECIFIED,
            ft_port: 0,
            it_port: 0,
            icon: None,
            age: PeerAge::Unconfirmed,
            policy_override: None,
        }
    }
}

// ── Beacon application outcome ───────────────────────────────────────────────

/// Icon follow-up requested by a beacon update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconAction {
    /// Nothing to do.
    None,
    /// The beacon advertises an icon the cache does not have: fetch it.
    Fetch {
        ipv4: Ipv4Addr,
        port: u16,
        hash: [u8; HASH_LEN],
    },
    /// The beacon no longer advertises an icon and the cached one was
    /// dropped.
    Dropped,
}

/// What applying a beacon to the registry did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconOutcome {
    /// Quit beacon: `expired` is set if the peer was active before.
    Quit { expired: bool },
    /// The beacon carries the local UUID: collision detected.
    UuidCollision,
    /// Record inserted or refreshed.
    Applied {
        /// A `peer_added` event is due (new record or back from
        /// Unconfirmed).
        added: bool,
        /// A `peer_updated` event is due.
        updated: bool,
        /// The peer advertises the same names as the local user.
        duplicate_name: bool,
        icon_action: IconAction,
    },
}

// ── Persisted form ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct PeerFile {
    /// Marks the record of the local user; such records never belong in the
    /// peer list and are rejected on load.
    #[serde(default)]
    me: bool,
    uuid: Uuid,
    first_name: String,
    last_name: String,
    #[serde(default)]
    icon_hash: Option<String>,
    #[serde(default)]
    policy_override: Option<ReceptionPolicy>,
}

// ── Peers list ───────────────────────────────────────────────────────────────

/// The map of known peers, owned by the discovery task.
#[derive(Debug)]
pub struct PeersList {
    peers: HashMap<Uuid, PeerRecord>,
    peers_path: PathBuf,
}

impl PeersList {
    /// Load the registry from `<conf>/peers.json`. Errors on individual
    /// records are isolated to that record.
    pub fn load(conf_path: &Path, local_uuid: Uuid) -> Self {
        let peers_path = conf_path.join("peers.json");
        let mut list = Self {
            peers: HashMap::new(),
            peers_path,
        };

        let content = match std::fs::read_to_string(&list.peers_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(event = "peers_read_failure", error = %e, "No peer list on disk, starting empty");
                return list;
            }
        };

        let entries: Vec<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                error!(event = "peers_parse_failure", error = %e, "Failed to parse peer list, starting empty");
                return list;
            }
        };

        for entry in entries {
            let record = match serde_json::from_value::<PeerFile>(entry) {
                Ok(file) if !file.me && !file.uuid.is_nil() && file.uuid != local_uuid => file,
                Ok(_) => {
                    warn!(event = "peers_invalid_record", "Invalid record found in peer list");
                    continue;
                }
                Err(e) => {
                    warn!(event = "peers_invalid_record", error = %e, "Invalid record found in peer list");
                    continue;
                }
            };

            let icon = record.icon_hash.as_deref().and_then(|hex| {
                let hash = icon::hash_from_hex(hex)?;
                UserIcon::from_cache(conf_path, &record.uuid, &hash).ok()
            });

            let mut first_name = record.first_name;
            if first_name.is_empty() && record.last_name.is_empty() {
                first_name = NO_NAME.to_string();
            }

            debug!(event = "peer_loaded", uuid = %record.uuid, "Peer loaded from disk");
            list.peers.insert(
                record.uuid,
                PeerRecord {
                    uuid: record.uuid,
                    first_name,
                    last_name: record.last_name,
                    ipv4: Ipv4Addr::UNSPECIFIED,
                    ft_port: 0,
                    it_port: 0,
                    icon,
                    age: PeerAge::Unconfirmed,
                    policy_override: record.policy_override,
                },
            );
        }

        info!(event = "peers_loaded", count = list.peers.len(), "Peer list loaded");
        list
    }

    /// Persist the registry to disk.
    pub fn save(&self) -> Result<()> {
        let files: Vec<PeerFile> = self
            .peers
            .values()
            .map(|peer| PeerFile {
                me: false,
                uuid: peer.uuid,
                first_name: peer.first_name.clone(),
                last_name: peer.last_name.clone(),
                icon_hash: peer.icon.as_ref().map(|i| icon::hash_to_hex(i.hash())),
                policy_override: peer.policy_override.clone(),
            })
            .collect();

        let content = serde_json::to_string_pretty(&files)?;
        atomic_write(&self.peers_path, content.as_bytes())
    }

    /// Apply a received beacon, returning the effects the caller must carry
    /// out (events, icon fetches, UUID regeneration).
    pub fn apply_beacon(
        &mut self,
        beacon: &Beacon,
        local_uuid: Uuid,
        local_first: &str,
        local_last: &str,
    ) -> BeaconOutcome {
        // A quitting user is marked Unconfirmed right away.
        if beacon.quit {
            let expired = match self.peers.get_mut(&beacon.uuid) {
                Some(peer) if peer.active() => {
                    peer.age = PeerAge::Unconfirmed;
                    info!(event = "peer_quit", uuid = %beacon.uuid, "Peer announced quit");
                    true
                }
                _ => false,
            };
            return BeaconOutcome::Quit { expired };
        }

        if beacon.uuid == local_uuid && !self.peers.contains_key(&beacon.uuid) {
            return BeaconOutcome::UuidCollision;
        }

        let mut first_name = beacon.first_name.clone();
        if first_name.is_empty() && beacon.last_name.is_empty() {
            first_name = NO_NAME.to_string();
        }

        let (added, updated, cached_icon_hash) = match self.peers.get_mut(&beacon.uuid) {
            Some(peer) => {
                let was_unconfirmed = !peer.active();
                let mut changed = false;

                if peer.first_name != first_name || peer.last_name != beacon.last_name {
                    peer.first_name = first_name;
                    peer.last_name = beacon.last_name.clone();
                    changed = true;
                }
                if peer.ipv4 != beacon.ipv4
                    || peer.ft_port != beacon.ft_port
                    || peer.it_port != beacon.it_port
                {
                    peer.ipv4 = beacon.ipv4;
                    peer.ft_port = beacon.ft_port;
                    peer.it_port = beacon.it_port;
                    changed = true;
                }
                peer.age = PeerAge::Ticks(0);

                if was_unconfirmed {
                    info!(event = "peer_refreshed", uuid = %beacon.uuid, "Peer back from unconfirmed");
                }
                let cached = peer.icon.as_ref().map(|i| *i.hash());
                (was_unconfirmed, changed && !was_unconfirmed, cached)
            }
            None => {
                let peer = PeerRecord {
                    uuid: beacon.uuid,
                    first_name,
                    last_name: beacon.last_name.clone(),
                    ipv4: beacon.ipv4,
                    ft_port: beacon.ft_port,
                    it_port: beacon.it_port,
                    icon: None,
                    age: PeerAge::Ticks(0),
                    policy_override: None,
                };
                info!(event = "peer_added", uuid = %beacon.uuid, name = %peer.display_name(), "New peer discovered");
                self.peers.insert(beacon.uuid, peer);
                (true, false, None)
            }
        };

        // Icon reconciliation.
        let icon_action = match beacon.icon_hash {
            Some(hash) => {
                if cached_icon_hash != Some(hash) {
                    IconAction::Fetch {
                        ipv4: beacon.ipv4,
                        port: beacon.it_port,
                        hash,
                    }
                } else {
                    IconAction::None
                }
            }
            None => {
                let record = self.peers.get_mut(&beacon.uuid).expect("record just touched");
                match record.icon.take() {
                    Some(old) => {
                        old.remove_cache();
                        IconAction::Dropped
                    }
                    None => IconAction::None,
                }
            }
        };

        let duplicate_name = (added || updated) && {
            let record = &self.peers[&beacon.uuid];
            record.first_name == local_first && record.last_name == local_last
        };
        if duplicate_name {
            warn!(event = "duplicate_name", uuid = %beacon.uuid, "Peer advertises the same name as the local user");
        }

        if added || updated || icon_action == IconAction::Dropped {
            let _ = self.save();
        }

        BeaconOutcome::Applied {
            added,
            updated,
            duplicate_name,
            icon_action,
        }
    }

    /// Increment every active peer's age; a peer reaching `AGE_MAX` expires.
    /// Returns the peers that expired on this tick.
    pub fn increment_ages(&mut self) -> Vec<Uuid> {
        let mut expired = Vec::new();
        for peer in self.peers.values_mut() {
            if let PeerAge::Ticks(age) = peer.age {
                if age + 1 >= AGE_MAX {
                    peer.age = PeerAge::Unconfirmed;
                    info!(event = "peer_expired", uuid = %peer.uuid, "Peer expired");
                    expired.push(peer.uuid);
                } else {
                    peer.age = PeerAge::Ticks(age + 1);
                }
            }
        }
        expired
    }

    /// Attach a freshly fetched icon to a peer. Returns whether the record
    /// was updated.
    pub fn set_icon(&mut self, uuid: Uuid, icon: UserIcon) -> bool {
        match self.peers.get_mut(&uuid) {
            Some(peer) => {
                peer.icon = Some(icon);
                let _ = self.save();
                true
            }
            None => false,
        }
    }

    /// Look up a peer (the anonymous UUID resolves to the synthetic record).
    pub fn peer(&self, uuid: Uuid) -> Option<PeerRecord> {
        if uuid == ANONYMOUS_UUID {
            return Some(PeerRecord::anonymous());
        }
        self.peers.get(&uuid).cloned()
    }

    /// Look up a peer only if a recent beacon confirms it.
    pub fn active_peer(&self, uuid: Uuid) -> Option<PeerRecord> {
        if uuid == ANONYMOUS_UUID {
            return Some(PeerRecord::anonymous());
        }
        self.peers.get(&uuid).filter(|p| p.active()).cloned()
    }

    /// A copied map of all currently active peers.
    pub fn active_peers(&self) -> HashMap<Uuid, PeerRecord> {
        self.peers
            .iter()
            .filter(|(_, p)| p.active())
            .map(|(uuid, p)| (*uuid, p.clone()))
            .collect()
    }

    /// All known UUIDs (used to steer UUID regeneration away from them).
    pub fn known_uuids(&self) -> Vec<Uuid> {
        self.peers.keys().copied().collect()
    }

    /// Set or clear the reception policy override of one peer.
    pub fn set_policy_override(&mut self, uuid: Uuid, policy: Option<ReceptionPolicy>) {
        if let Some(peer) = self.peers.get_mut(&uuid) {
            peer.policy_override = policy;
            let _ = self.save();
        }
    }

    /// Reset every peer to the default reception policy.
    pub fn reset_policy_overrides(&mut self) {
        for peer in self.peers.values_mut() {
            peer.policy_override = None;
        }
        let _ = self.save();
    }

    /// Remove a peer entirely (user action).
    pub fn remove(&mut self, uuid: Uuid) {
        if let Some(peer) = self.peers.remove(&uuid) {
            if let Some(icon) = peer.icon {
                icon.remove_cache();
            }
            let _ = self.save();
        }
    }

    /// First active peer carrying exactly these names, if any (used after a
    /// local rename).
    pub fn duplicate_of_names(&self, first: &str, last: &str) -> Option<Uuid> {
        self.peers
            .values()
            .find(|p| p.active() && p.first_name == first && p.last_name == last)
            .map(|p| p.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon(uuid: Uuid) -> Beacon {
        Beacon {
            uuid,
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            ipv4: Ipv4Addr::new(10, 0, 0, 9),
            ft_port: 40001,
            it_port: 0,
            icon_hash: None,
            quit: false,
        }
    }

    fn fresh_list(dir: &Path) -> PeersList {
        PeersList::load(dir, Uuid::new_v4())
    }

    #[test]
    fn test_beacon_adds_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());
        let uuid = Uuid::new_v4();

        let outcome = list.apply_beacon(&beacon(uuid), Uuid::new_v4(), "", "");
        assert!(matches!(
            outcome,
            BeaconOutcome::Applied { added: true, updated: false, .. }
        ));

        // Identical beacon: idempotent, no further events.
        let outcome = list.apply_beacon(&beacon(uuid), Uuid::new_v4(), "", "");
        assert!(matches!(
            outcome,
            BeaconOutcome::Applied { added: false, updated: false, .. }
        ));

        // Changed address: peer_updated due.
        let mut moved = beacon(uuid);
        moved.ipv4 = Ipv4Addr::new(10, 0, 0, 10);
        let outcome = list.apply_beacon(&moved, Uuid::new_v4(), "", "");
        assert!(matches!(
            outcome,
            BeaconOutcome::Applied { added: false, updated: true, .. }
        ));
    }

    #[test]
    fn test_aging_expires_after_age_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());
        let uuid = Uuid::new_v4();
        list.apply_beacon(&beacon(uuid), Uuid::new_v4(), "", "");

        for _ in 0..AGE_MAX - 1 {
            assert!(list.increment_ages().is_empty());
        }
        assert_eq!(list.increment_ages(), vec![uuid]);
        assert!(!list.peers[&uuid].active());

        // Expired exactly once.
        assert!(list.increment_ages().is_empty());

        // A fresh beacon re-adds the peer.
        let outcome = list.apply_beacon(&beacon(uuid), Uuid::new_v4(), "", "");
        assert!(matches!(
            outcome,
            BeaconOutcome::Applied { added: true, .. }
        ));
    }

    #[test]
    fn test_quit_beacon_expires_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());
        let uuid = Uuid::new_v4();
        list.apply_beacon(&beacon(uuid), Uuid::new_v4(), "", "");

        let mut quit = beacon(uuid);
        quit.quit = true;
        assert_eq!(
            list.apply_beacon(&quit, Uuid::new_v4(), "", ""),
            BeaconOutcome::Quit { expired: true }
        );
        assert_eq!(
            list.apply_beacon(&quit, Uuid::new_v4(), "", ""),
            BeaconOutcome::Quit { expired: false }
        );
    }

    #[test]
    fn test_uuid_collision_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());
        let local = Uuid::new_v4();

        assert_eq!(
            list.apply_beacon(&beacon(local), local, "", ""),
            BeaconOutcome::UuidCollision
        );
        // No record is created for the self-observation.
        assert!(list.peer(local).is_none());
    }

    #[test]
    fn test_duplicate_name_detected() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());

        let outcome = list.apply_beacon(&beacon(Uuid::new_v4()), Uuid::new_v4(), "Grace", "Hopper");
        assert!(matches!(
            outcome,
            BeaconOutcome::Applied { duplicate_name: true, .. }
        ));
    }

    #[test]
    fn test_icon_fetch_requested_on_new_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = fresh_list(dir.path());
        let uuid = Uuid::new_v4();

        let mut with_icon = beacon(uuid);
        with_icon.it_port = 40002;
        with_icon.icon_hash = Some([0x11; HASH_LEN]);

        let outcome = list.apply_beacon(&with_icon, Uuid::new_v4(), "", "");
        let BeaconOutcome::Applied { icon_action, .. } = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(
            icon_action,
            IconAction::Fetch {
                ipv4: with_icon.ipv4,
                port: 40002,
                hash: [0x11; HASH_LEN],
            }
        );
    }

    #[test]
    fn test_persistence_round_trip_starts_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let local = Uuid::new_v4();
        let uuid = Uuid::new_v4();

        {
            let mut list = PeersList::load(dir.path(), local);
            list.apply_beacon(&beacon(uuid), local, "", "");
            list.save().unwrap();
        }

        let reloaded = PeersList::load(dir.path(), local);
        let peer = reloaded.peer(uuid).unwrap();
        assert_eq!(peer.first_name, "Grace");
        assert!(!peer.active());
        assert!(reloaded.active_peer(uuid).is_none());
    }

    #[test]
    fn test_anonymous_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let list = fresh_list(dir.path());
        let anon = list.peer(ANONYMOUS_UUID).unwrap();
        assert_eq!(anon.first_name, "Anonymous");
    }

    #[test]
    fn test_corrupted_record_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let good = Uuid::new_v4();
        let content = format!(
            r#"[{{"uuid":"{}","first_name":"A","last_name":"B"}}, {{"bogus":true}}]"#,
            good
        );
        std::fs::write(dir.path().join("peers.json"), content).unwrap();

        let list = PeersList::load(dir.path(), Uuid::new_v4());
        assert!(list.peer(good).is_some());
        assert_eq!(list.known_uuids().len(), 1);
    }
}
