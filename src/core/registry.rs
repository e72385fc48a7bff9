//! The registry service.
//!
//! One task owns the peer list for the whole daemon lifetime: it consumes
//! decoded beacons from the discovery protocol, runs the aging timer,
//! manages the per-peer icon fetch clients and answers lookup requests
//! posted from other tasks. External snapshots are copies returned through
//! one-shot replies, so the list itself is never shared.

use crate::core::config::AGING_INTERVAL;
use crate::core::discovery::beacon::{Beacon, HASH_LEN};
use crate::core::events::CoreEvent;
use crate::core::icons::client::{self, IconFetch};
use crate::core::identity::LocalIdentity;
use crate::core::peer_registry::{BeaconOutcome, IconAction, PeerRecord, PeersList};
use crate::core::reception::ReceptionPolicy;
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

// ── Requests ─────────────────────────────────────────────────────────────────

/// Lookup and mutation requests posted into the registry task.
#[derive(Debug)]
pub enum RegistryRequest {
    ActivePeers(oneshot::Sender<HashMap<Uuid, PeerRecord>>),
    Peer(Uuid, oneshot::Sender<Option<PeerRecord>>),
    ActivePeer(Uuid, oneshot::Sender<Option<PeerRecord>>),
    SetPolicyOverride(Uuid, Option<ReceptionPolicy>),
    ResetPolicyOverrides,
    Remove(Uuid),
    /// Re-check for peers carrying these names (after a local rename).
    CheckDuplicateName { first: String, last: String },
    /// Persist the registry (shutdown flush).
    Flush(oneshot::Sender<()>),
}

/// Handle to the registry task.
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    requests: mpsc::Sender<RegistryRequest>,
}

impl RegistryHandle {
    /// A copied map of the currently active peers.
    pub async fn active_peers(&self) -> HashMap<Uuid, PeerRecord> {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(RegistryRequest::ActivePeers(tx)).await.is_err() {
            return HashMap::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn peer(&self, uuid: Uuid) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(RegistryRequest::Peer(uuid, tx)).await.ok()?;
        rx.await.ok()?
    }

    pub async fn active_peer(&self, uuid: Uuid) -> Option<PeerRecord> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(RegistryRequest::ActivePeer(uuid, tx))
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn set_policy_override(&self, uuid: Uuid, policy: Option<ReceptionPolicy>) {
        let _ = self
            .requests
            .send(RegistryRequest::SetPolicyOverride(uuid, policy))
            .await;
    }

    pub async fn reset_policy_overrides(&self) {
        let _ = self.requests.send(RegistryRequest::ResetPolicyOverrides).await;
    }

    pub async fn remove(&self, uuid: Uuid) {
        let _ = self.requests.send(RegistryRequest::Remove(uuid)).await;
    }

    pub async fn check_duplicate_name(&self, first: &str, last: &str) {
        let _ = self
            .requests
            .send(RegistryRequest::CheckDuplicateName {
                first: first.to_string(),
                last: last.to_string(),
            })
            .await;
    }

    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(RegistryRequest::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ── Service ──────────────────────────────────────────────────────────────────

/// One running icon client per peer.
struct IconClient {
    hash: [u8; HASH_LEN],
    sos: SignalOfStop,
}

/// The registry task state.
pub struct RegistryService {
    peers: PeersList,
    identity: Arc<Mutex<LocalIdentity>>,
    conf_path: PathBuf,
    events: mpsc::UnboundedSender<CoreEvent>,
    /// Poked when the local identity changed (UUID regeneration) so the
    /// orchestrator refreshes the advertised beacon.
    identity_changed_tx: mpsc::Sender<()>,
    icon_clients: HashMap<Uuid, IconClient>,
    icon_results_tx: mpsc::Sender<(Uuid, crate::core::icon::UserIcon)>,
}

impl RegistryService {
    /// Spawn the registry task.
    pub fn spawn(
        identity: Arc<Mutex<LocalIdentity>>,
        conf_path: PathBuf,
        mut beacons_rx: mpsc::Receiver<Beacon>,
        events: mpsc::UnboundedSender<CoreEvent>,
        identity_changed_tx: mpsc::Sender<()>,
        sos: SignalOfStop,
    ) -> RegistryHandle {
        let local_uuid = identity.lock().expect("identity mutex poisoned").uuid();
        let peers = PeersList::load(&conf_path, local_uuid);

        let (requests_tx, mut requests_rx) = mpsc::channel(64);
        let (icon_results_tx, mut icon_results_rx) = mpsc::channel(16);

        let mut service = Self {
            peers,
            identity,
            conf_path,
            events,
            identity_changed_tx,
            icon_clients: HashMap::new(),
            icon_results_tx,
        };

        tokio::spawn(async move {
            let mut aging = tokio::time::interval(AGING_INTERVAL);
            aging.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            aging.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = aging.tick() => {
                        for uuid in service.peers.increment_ages() {
                            service.emit(CoreEvent::PeerExpired(uuid));
                        }
                    }
                    beacon = beacons_rx.recv() => match beacon {
                        Some(beacon) => service.handle_beacon(beacon),
                        None => break,
                    },
                    result = icon_results_rx.recv() => {
                        if let Some((uuid, icon)) = result {
                            service.icon_clients.remove(&uuid);
                            if service.peers.set_icon(uuid, icon) {
                                service.emit(CoreEvent::PeerUpdated(uuid));
                            }
                        }
                    }
                    request = requests_rx.recv() => match request {
                        Some(request) => service.handle_request(request),
                        None => break,
                    },
                    _ = sos.wait() => break,
                }
            }

            // Shutdown: stop icon clients and persist the registry.
            for (_, client) in service.icon_clients.drain() {
                client.sos.cancel();
            }
            if let Err(e) = service.peers.save() {
                warn!(event = "peers_save_failure", error = %e, "Failed saving the peer list at shutdown");
            }
            info!(event = "registry_stopped", "Registry service stopped");
        });

        RegistryHandle {
            requests: requests_tx,
        }
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    fn handle_beacon(&mut self, beacon: Beacon) {
        let (local_uuid, local_first, local_last) = {
            let identity = self.identity.lock().expect("identity mutex poisoned");
            (
                identity.uuid(),
                identity.first_name().to_string(),
                identity.last_name().to_string(),
            )
        };

        match self
            .peers
            .apply_beacon(&beacon, local_uuid, &local_first, &local_last)
        {
            BeaconOutcome::Quit { expired } => {
                if expired {
                    self.stop_icon_client(beacon.uuid);
                    self.emit(CoreEvent::PeerExpired(beacon.uuid));
                }
            }
            BeaconOutcome::UuidCollision => {
                let used = self.peers.known_uuids();
                {
                    let mut identity = self.identity.lock().expect("identity mutex poisoned");
                    identity.regenerate_uuid(&used);
                }
                // Poke the orchestrator to rebuild and republish the
                // beacon. Never blocks on it: a full channel already holds
                // a pending refresh.
                let _ = self.identity_changed_tx.try_send(());
            }
            BeaconOutcome::Applied {
                added,
                updated,
                duplicate_name,
                icon_action,
            } => {
                if added {
                    self.emit(CoreEvent::PeerAdded(beacon.uuid));
                } else if updated {
                    self.emit(CoreEvent::PeerUpdated(beacon.uuid));
                }
                if duplicate_name {
                    self.emit(CoreEvent::DuplicateNameDetected(beacon.uuid));
                }

                match icon_action {
                    IconAction::Fetch { ipv4, port, hash } => {
                        self.ensure_icon_client(beacon.uuid, ipv4, port, hash);
                    }
                    IconAction::Dropped => {
                        self.stop_icon_client(beacon.uuid);
                        self.emit(CoreEvent::PeerUpdated(beacon.uuid));
                    }
                    IconAction::None => {}
                }
            }
        }
    }

    /// Spawn or retarget the icon client of one peer.
    fn ensure_icon_client(
        &mut self,
        uuid: Uuid,
        ipv4: std::net::Ipv4Addr,
        port: u16,
        hash: [u8; HASH_LEN],
    ) {
        if let Some(client) = self.icon_clients.get(&uuid) {
            if client.hash == hash {
                return;
            }
            client.sos.cancel();
        }

        let sos = SignalOfStop::new();
        client::spawn_fetch(
            self.conf_path.clone(),
            IconFetch {
                peer_uuid: uuid,
                ipv4,
                port,
                hash,
            },
            self.icon_results_tx.clone(),
            sos.clone(),
        );
        self.icon_clients.insert(uuid, IconClient { hash, sos });
    }

    fn stop_icon_client(&mut self, uuid: Uuid) {
        if let Some(client) = self.icon_clients.remove(&uuid) {
            client.sos.cancel();
        }
    }

    fn handle_request(&mut self, request: RegistryRequest) {
        match request {
            RegistryRequest::ActivePeers(reply) => {
                let _ = reply.send(self.peers.active_peers());
            }
            RegistryRequest::Peer(uuid, reply) => {
                let _ = reply.send(self.peers.peer(uuid));
            }
            RegistryRequest::ActivePeer(uuid, reply) => {
                let _ = reply.send(self.peers.active_peer(uuid));
            }
            RegistryRequest::SetPolicyOverride(uuid, policy) => {
                self.peers.set_policy_override(uuid, policy);
            }
            RegistryRequest::ResetPolicyOverrides => {
                self.peers.reset_policy_overrides();
            }
            RegistryRequest::Remove(uuid) => {
                self.stop_icon_client(uuid);
                self.peers.remove(uuid);
            }
            RegistryRequest::CheckDuplicateName { first, last } => {
                if let Some(uuid) = self.peers.duplicate_of_names(&first, &last) {
                    self.emit(CoreEvent::DuplicateNameDetected(uuid));
                }
            }
            RegistryRequest::Flush(reply) => {
                if let Err(e) = self.peers.save() {
                    warn!(event = "peers_save_failure", error = %e, "Failed saving the peer list");
                }
                let _ = reply.send(());
            }
        }
    }
}
