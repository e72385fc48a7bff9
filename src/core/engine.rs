//! The orchestrator.
//!
//! Sole coordinator of the networked components: it owns the discovery
//! protocol and server lifecycles (re-created whenever the network entry
//! changes), applies reception policies to inbound sessions, turns picker
//! path lists into outgoing sessions and mediates every user decision
//! through typed channels. The UI layer drives it exclusively through
//! posted [`EngineCommand`]s and observes it through [`CoreEvent`]s.

use crate::core::discovery::protocol::{DiscoveryHandle, DiscoveryProtocol};
use crate::core::events::{
    CoreEvent, DuplicateFileDecisionSink, SessionEvent, SharingDecision, SharingDecisionSink,
    SharingRequest,
};
use crate::core::icon::UserIcon;
use crate::core::icons::server::IconServer;
use crate::core::identity::{LocalIdentity, OperationalMode, ANONYMOUS_UUID};
use crate::core::network_entries::{EntriesMonitor, NetworkEntry};
use crate::core::reception::{ReceptionAction, ReceptionPolicy};
use crate::core::registry::{RegistryHandle, RegistryService};
use crate::core::transfer::files::TransferList;
use crate::core::transfer::receiver::spawn_receiver;
use crate::core::transfer::sender::spawn_sender;
use crate::core::transfer::server::{InboundConnection, TransferServer};
use crate::core::transfer::session::SessionHandle;
use anyhow::{anyhow, bail, Result};
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

// ── Commands and handle ──────────────────────────────────────────────────────

/// Requests posted into the orchestrator.
pub enum EngineCommand {
    /// Start one outgoing session per selected peer.
    SendFiles {
        paths: Vec<PathBuf>,
        peers: Vec<Uuid>,
        message: String,
    },
    /// Switch the operational mode. Going Offline with live inbound
    /// sessions requires `force`; going Online requires a network entry.
    SetMode {
        mode: OperationalMode,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Rebind all protocols onto another detected entry.
    ChangeNetworkEntry {
        entry: NetworkEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    SetNames {
        first: String,
        last: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Replace (or remove, with `None`) the local avatar.
    SetIcon {
        image_path: Option<PathBuf>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetDefaultPolicy(ReceptionPolicy),
    SetPeerPolicy(Uuid, Option<ReceptionPolicy>),
    /// A snapshot of the live session handles.
    Sessions(oneshot::Sender<Vec<SessionHandle>>),
}

/// Handle used by the UI layer to drive the orchestrator.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    registry: RegistryHandle,
}

impl EngineHandle {
    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub async fn send_files(&self, paths: Vec<PathBuf>, peers: Vec<Uuid>, message: String) {
        let _ = self
            .commands
            .send(EngineCommand::SendFiles {
                paths,
                peers,
                message,
            })
            .await;
    }

    pub async fn set_mode(&self, mode: OperationalMode, force: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SetMode {
                mode,
                force,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("orchestrator gone"))?;
        rx.await.map_err(|_| anyhow!("orchestrator gone"))?
    }

    pub async fn change_network_entry(&self, entry: NetworkEntry) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::ChangeNetworkEntry { entry, reply: tx })
            .await
            .map_err(|_| anyhow!("orchestrator gone"))?;
        rx.await.map_err(|_| anyhow!("orchestrator gone"))?
    }

    pub async fn set_names(&self, first: &str, last: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SetNames {
                first: first.to_string(),
                last: last.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("orchestrator gone"))?;
        rx.await.map_err(|_| anyhow!("orchestrator gone"))?
    }

    pub async fn set_icon(&self, image_path: Option<PathBuf>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::SetIcon {
                image_path,
                reply: tx,
            })
            .await
            .map_err(|_| anyhow!("orchestrator gone"))?;
        rx.await.map_err(|_| anyhow!("orchestrator gone"))?
    }

    pub async fn set_default_policy(&self, policy: ReceptionPolicy) {
        let _ = self.commands.send(EngineCommand::SetDefaultPolicy(policy)).await;
    }

    pub async fn set_peer_policy(&self, uuid: Uuid, policy: Option<ReceptionPolicy>) {
        let _ = self
            .commands
            .send(EngineCommand::SetPeerPolicy(uuid, policy))
            .await;
    }

    pub async fn sessions(&self) -> Vec<SessionHandle> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Sessions(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Channels connecting the orchestrator to the UI layer.
pub struct UiChannels {
    /// Sharing requests the reception policy resolved to Ask.
    pub sharing_sink: SharingDecisionSink,
    /// Duplicate-file conflicts.
    pub duplicate_sink: DuplicateFileDecisionSink,
    /// Core events.
    pub events: mpsc::UnboundedSender<CoreEvent>,
    /// Per-session events, keyed by session id.
    pub session_events: mpsc::UnboundedSender<(u32, SessionEvent)>,
}

struct SessionEntry {
    handle: SessionHandle,
    inbound: bool,
}

pub struct Engine {
    identity: Arc<Mutex<LocalIdentity>>,
    registry: RegistryHandle,
    monitor: EntriesMonitor,
    ui: UiChannels,
    data_path: PathBuf,
    conf_path: PathBuf,

    current_entry: Option<NetworkEntry>,
    discovery: Option<DiscoveryHandle>,
    discovery_sos: Option<crate::utils::sos::SignalOfStop>,
    servers_sos: Option<crate::utils::sos::SignalOfStop>,

    sessions: Vec<SessionEntry>,

    // Plumbing the engine loop selects over.
    beacons_tx: mpsc::Sender<crate::core::discovery::beacon::Beacon>,
    discovery_error_tx: mpsc::Sender<()>,
    inbound_tx: mpsc::Sender<InboundConnection>,
    sharing_requests_tx: mpsc::Sender<(SharingRequest, oneshot::Sender<SharingDecision>)>,
}

impl Engine {
    /// Build the orchestrator and spawn its task and the registry task.
    /// Network protocols start once `set_mode(Online)` is requested.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        identity: Arc<Mutex<LocalIdentity>>,
        conf_path: PathBuf,
        data_path: PathBuf,
        monitor: EntriesMonitor,
        ui: UiChannels,
        mut paths_rx: mpsc::Receiver<Vec<PathBuf>>,
        sos: crate::utils::sos::SignalOfStop,
    ) -> (EngineHandle, tokio::task::JoinHandle<()>) {
        let (beacons_tx, beacons_rx) = mpsc::channel(64);
        let (identity_changed_tx, mut identity_changed_rx) = mpsc::channel(4);
        let (discovery_error_tx, mut discovery_error_rx) = mpsc::channel(4);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
        let (sharing_requests_tx, mut sharing_requests_rx) = mpsc::channel(16);
        let (commands_tx, mut commands_rx) = mpsc::channel(32);

        let registry = RegistryService::spawn(
            Arc::clone(&identity),
            conf_path.clone(),
            beacons_rx,
            ui.events.clone(),
            identity_changed_tx,
            sos.clone(),
        );

        let mut engine = Engine {
            identity,
            registry: registry.clone(),
            monitor: monitor.clone(),
            ui,
            data_path,
            conf_path,
            current_entry: None,
            discovery: None,
            discovery_sos: None,
            servers_sos: None,
            sessions: Vec::new(),
            beacons_tx,
            discovery_error_tx,
            inbound_tx,
            sharing_requests_tx,
        };

        let handle = EngineHandle {
            commands: commands_tx,
            registry,
        };

        let task = tokio::spawn(async move {
            let mut entries_rx = engine.monitor.subscribe();

            loop {
                tokio::select! {
                    command = commands_rx.recv() => match command {
                        Some(command) => engine.handle_command(command).await,
                        None => break,
                    },
                    inbound = inbound_rx.recv() => {
                        if let Some(inbound) = inbound {
                            engine.handle_inbound(inbound);
                        }
                    }
                    query = sharing_requests_rx.recv() => {
                        if let Some((request, reply)) = query {
                            engine.resolve_sharing(request, reply).await;
                        }
                    }
                    paths = paths_rx.recv() => {
                        if let Some(paths) = paths {
                            engine.emit(CoreEvent::PathsReceived(paths));
                        }
                    }
                    changed = entries_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        engine.handle_entries_changed().await;
                    }
                    _ = identity_changed_rx.recv() => {
                        engine.refresh_beacon().await;
                    }
                    _ = discovery_error_rx.recv() => {
                        engine.handle_discovery_error().await;
                    }
                    _ = sos.wait() => break,
                }
            }

            engine.shutdown().await;
        });

        (handle, task)
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.ui.events.send(event);
    }

    // ── Command handling ─────────────────────────────────────────────────

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SendFiles {
                paths,
                peers,
                message,
            } => {
                self.send_files(paths, peers, message).await;
            }
            EngineCommand::SetMode { mode, force, reply } => {
                let result = match mode {
                    OperationalMode::Online => self.go_online().await,
                    OperationalMode::Offline => self.go_offline(force).await,
                };
                let _ = reply.send(result);
            }
            EngineCommand::ChangeNetworkEntry { entry, reply } => {
                let _ = reply.send(self.change_entry(entry).await);
            }
            EngineCommand::SetNames { first, last, reply } => {
                let result = self.set_names(&first, &last).await;
                let _ = reply.send(result);
            }
            EngineCommand::SetIcon { image_path, reply } => {
                let _ = reply.send(self.set_icon(image_path).await);
            }
            EngineCommand::SetDefaultPolicy(policy) => {
                {
                    let mut identity = self.lock_identity();
                    identity.set_policy(policy, &self.data_path);
                }
                self.refresh_beacon().await;
            }
            EngineCommand::SetPeerPolicy(uuid, policy) => {
                self.registry.set_policy_override(uuid, policy).await;
            }
            EngineCommand::Sessions(reply) => {
                self.prune_sessions();
                let handles = self.sessions.iter().map(|s| s.handle.clone()).collect();
                let _ = reply.send(handles);
            }
        }
    }

    fn lock_identity(&self) -> std::sync::MutexGuard<'_, LocalIdentity> {
        self.identity.lock().expect("identity mutex poisoned")
    }

    fn prune_sessions(&mut self) {
        self.sessions.retain(|s| !s.handle.state().is_terminal());
    }

    // ── Outgoing transfers ───────────────────────────────────────────────

    async fn send_files(&mut self, paths: Vec<PathBuf>, peers: Vec<Uuid>, message: String) {
        let list = match TransferList::from_paths(&paths) {
            Ok(list) if !list.files.is_empty() => list,
            Ok(_) => {
                warn!(event = "send_empty_list", "Nothing to send");
                return;
            }
            Err(e) => {
                warn!(event = "send_invalid_list", error = %e, "Refusing the transfer list");
                return;
            }
        };

        // An Offline initiator stays anonymous on the wire.
        let (local_uuid, mode) = {
            let identity = self.lock_identity();
            (identity.uuid(), identity.mode())
        };
        let wire_uuid = match mode {
            OperationalMode::Online => local_uuid,
            OperationalMode::Offline => ANONYMOUS_UUID,
        };

        for peer_uuid in peers {
            let Some(peer) = self.registry.active_peer(peer_uuid).await else {
                warn!(event = "send_peer_unavailable", peer = %peer_uuid, "Peer not active, skipping");
                continue;
            };
            if peer.ft_port == 0 {
                warn!(event = "send_peer_unavailable", peer = %peer_uuid, "Peer has no transfer port, skipping");
                continue;
            }

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let handle = spawn_sender(
                wire_uuid,
                peer.uuid,
                SocketAddrV4::new(peer.ipv4, peer.ft_port),
                list.clone(),
                message.clone(),
                events_tx,
            );
            self.forward_session_events(handle.id, events_rx);
            self.sessions.push(SessionEntry {
                handle,
                inbound: false,
            });
        }
        self.prune_sessions();
    }

    // ── Inbound transfers ────────────────────────────────────────────────

    fn handle_inbound(&mut self, inbound: InboundConnection) {
        let local_uuid = self.lock_identity().uuid();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = spawn_receiver(
            inbound.stream,
            local_uuid,
            self.sharing_requests_tx.clone(),
            self.ui.duplicate_sink.clone(),
            events_tx,
        );
        self.forward_session_events(handle.id, events_rx);
        self.sessions.push(SessionEntry {
            handle,
            inbound: true,
        });
        self.prune_sessions();
    }

    fn forward_session_events(&self, id: u32, mut events_rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let sink = self.ui.session_events.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if sink.send((id, event)).is_err() {
                    return;
                }
            }
        });
    }

    /// Apply the sender's reception policy: auto-accept, auto-reject or
    /// route the request to the user.
    async fn resolve_sharing(
        &mut self,
        mut request: SharingRequest,
        reply: oneshot::Sender<SharingDecision>,
    ) {
        let peer = self.registry.peer(request.peer_uuid).await;
        let (peer_name, policy_override) = match &peer {
            Some(peer) => (peer.display_name(), peer.policy_override.clone()),
            None => ("Anonymous".to_string(), None),
        };
        request.peer_name = peer_name.clone();

        let default_policy = self.lock_identity().policy().clone();
        let policy = policy_override
            .as_ref()
            .map(|p| p.resolve(&default_policy))
            .unwrap_or(&default_policy)
            .clone();

        match policy.action {
            ReceptionAction::Accept => {
                info!(event = "share_auto_accepted", peer = %request.peer_uuid, "Sharing request auto-accepted by policy");
                let _ = reply.send(SharingDecision::Accept {
                    path: policy.destination(&peer_name),
                    message: String::new(),
                });
            }
            ReceptionAction::Reject => {
                info!(event = "share_auto_rejected", peer = %request.peer_uuid, "Sharing request auto-rejected by policy");
                let _ = reply.send(SharingDecision::Reject {
                    message: String::new(),
                });
            }
            ReceptionAction::Ask => {
                // Forward to the UI; a dropped reply rejects by default.
                let _ = self.ui.sharing_sink.send((request, reply)).await;
            }
        }
    }

    // ── Mode and network lifecycle ───────────────────────────────────────

    async fn go_online(&mut self) -> Result<()> {
        if self.lock_identity().mode() == OperationalMode::Online {
            return Ok(());
        }

        let entry = match &self.current_entry {
            Some(entry) => entry.clone(),
            None => {
                let entries = self.monitor.entries();
                let entry = entries
                    .first()
                    .cloned()
                    .ok_or_else(|| anyhow!("no network entry available"))?;
                self.current_entry = Some(entry.clone());
                self.emit(CoreEvent::NetworkEntryChanged(Some(entry.clone())));
                entry
            }
        };

        self.start_servers(&entry).await?;

        let beacon = {
            let mut identity = self.lock_identity();
            identity.set_mode(OperationalMode::Online);
            identity.beacon()
        };
        let beacon = match beacon {
            Ok(beacon) => beacon,
            Err(e) => {
                // Going Online is blocked while the beacon is invalid.
                self.stop_servers();
                self.lock_identity().set_mode(OperationalMode::Offline);
                bail!("cannot go online: {}", e);
            }
        };

        self.ensure_discovery(&entry)?;
        if let Some(discovery) = &self.discovery {
            discovery.update_beacon(Some(beacon)).await;
            discovery.set_mode(OperationalMode::Online).await;
        }

        info!(event = "mode_changed", mode = "online", entry = %entry.label(), "Daemon is online");
        Ok(())
    }

    async fn go_offline(&mut self, force: bool) -> Result<()> {
        let has_inbound = self
            .sessions
            .iter()
            .any(|s| s.inbound && !s.handle.state().is_terminal());
        if has_inbound && !force {
            bail!("inbound transfers are active");
        }

        if let Some(discovery) = &self.discovery {
            discovery.set_mode(OperationalMode::Offline).await;
        }
        self.stop_servers();
        {
            let mut identity = self.lock_identity();
            identity.set_mode(OperationalMode::Offline);
            identity.ft_port = None;
            identity.it_port = None;
        }

        info!(event = "mode_changed", mode = "offline", "Daemon is offline");
        Ok(())
    }

    async fn change_entry(&mut self, entry: NetworkEntry) -> Result<()> {
        if self.current_entry.as_ref() == Some(&entry) {
            return Ok(());
        }
        if !self.monitor.entries().contains(&entry) {
            bail!("network entry {} is not available", entry.label());
        }

        let mode = self.lock_identity().mode();
        self.teardown_network().await;
        self.current_entry = Some(entry.clone());
        self.emit(CoreEvent::NetworkEntryChanged(Some(entry)));

        if mode == OperationalMode::Online {
            self.go_online().await?;
        }
        Ok(())
    }

    /// React to an interface-list change: keep the current entry if still
    /// valid, otherwise rebind to the first remaining entry or force
    /// offline.
    async fn handle_entries_changed(&mut self) {
        let entries = self.monitor.entries();
        if let Some(current) = &self.current_entry {
            if entries.contains(current) {
                return;
            }
            error!(event = "network_entry_lost", entry = %current.label(), "Active network entry no more available");
        }

        let mode = self.lock_identity().mode();
        self.teardown_network().await;

        match entries.first() {
            Some(entry) => {
                self.current_entry = Some(entry.clone());
                self.emit(CoreEvent::NetworkEntryChanged(Some(entry.clone())));
                warn!(event = "network_entry_switched", entry = %entry.label(), "Network entry changed automatically");
                if mode == OperationalMode::Online {
                    if let Err(e) = self.go_online().await {
                        error!(event = "rebind_failure", error = %e, "Failed rebinding after the entry change");
                        self.monitor.refresh().await;
                    }
                }
            }
            None => {
                self.current_entry = None;
                self.emit(CoreEvent::NetworkEntryChanged(None));
                warn!(event = "forced_offline", "No network entry left, daemon forced offline");
            }
        }
    }

    async fn handle_discovery_error(&mut self) {
        // The protocol already went silent; reflect it and rescan.
        error!(event = "discovery_error", "Discovery send errors, going offline");
        let _ = self.go_offline(true).await;
        self.emit(CoreEvent::DiscoveryError);
        self.monitor.refresh().await;
    }

    /// Start the transfer and icon servers on the entry and record the
    /// bindings in the identity.
    async fn start_servers(&mut self, entry: &NetworkEntry) -> Result<()> {
        self.stop_servers();
        let sos = crate::utils::sos::SignalOfStop::new();

        let ft_server = TransferServer::bind(entry.ipv4).await?;
        let ft_port = ft_server.port();
        tokio::spawn(ft_server.run(self.inbound_tx.clone(), sos.clone()));

        let icon_data = {
            let identity = self.lock_identity();
            identity.icon().and_then(|icon| icon.read_data().ok())
        };
        let it_port = match icon_data {
            Some(data) => match IconServer::bind(entry.ipv4).await {
                Ok(server) => {
                    let port = server.port();
                    tokio::spawn(server.run(data, sos.clone()));
                    Some(port)
                }
                Err(e) => {
                    warn!(event = "icon_server_failure", error = %e, "Icon server failed to start");
                    None
                }
            },
            None => None,
        };

        {
            let mut identity = self.lock_identity();
            identity.bound_ipv4 = Some(entry.ipv4);
            identity.ft_port = Some(ft_port);
            identity.it_port = it_port;
        }
        self.servers_sos = Some(sos);
        Ok(())
    }

    fn stop_servers(&mut self) {
        if let Some(sos) = self.servers_sos.take() {
            sos.cancel();
        }
        let mut identity = self.lock_identity();
        identity.ft_port = None;
        identity.it_port = None;
    }

    fn ensure_discovery(&mut self, entry: &NetworkEntry) -> Result<()> {
        if self.discovery.is_some() {
            return Ok(());
        }

        let protocol = DiscoveryProtocol::new(entry)?;
        let sos = crate::utils::sos::SignalOfStop::new();
        let handle = protocol.spawn(
            OperationalMode::Offline,
            None,
            self.beacons_tx.clone(),
            self.discovery_error_tx.clone(),
            sos.clone(),
        );
        self.discovery = Some(handle);
        self.discovery_sos = Some(sos);
        Ok(())
    }

    /// Rebuild and republish the beacon after an identity change.
    async fn refresh_beacon(&mut self) {
        let Some(discovery) = &self.discovery else {
            return;
        };
        let beacon = self.identity.lock().expect("identity mutex poisoned").beacon();
        match beacon {
            Ok(beacon) => discovery.update_beacon(Some(beacon)).await,
            Err(e) => {
                warn!(event = "beacon_refresh_failure", error = %e, "Local beacon became invalid");
                discovery.update_beacon(None).await;
            }
        }
    }

    /// Drop discovery and servers (entry change or loss).
    async fn teardown_network(&mut self) {
        if let Some(discovery) = &self.discovery {
            discovery.set_mode(OperationalMode::Offline).await;
        }
        if let Some(sos) = self.discovery_sos.take() {
            sos.cancel();
        }
        self.discovery = None;
        self.stop_servers();
        {
            let mut identity = self.lock_identity();
            identity.set_mode(OperationalMode::Offline);
            identity.bound_ipv4 = None;
        }
        self.current_entry = None;
    }

    // ── Identity operations ──────────────────────────────────────────────

    async fn set_names(&mut self, first: &str, last: &str) -> Result<()> {
        let changed = {
            let mut identity = self.lock_identity();
            identity.set_names(first, last)?
        };
        if changed {
            let (first, last) = {
                let identity = self.lock_identity();
                (
                    identity.first_name().to_string(),
                    identity.last_name().to_string(),
                )
            };
            self.registry.check_duplicate_name(&first, &last).await;
            self.refresh_beacon().await;
        }
        Ok(())
    }

    async fn set_icon(&mut self, image_path: Option<PathBuf>) -> Result<()> {
        let icon = match image_path {
            Some(path) => {
                let image = image::open(&path)
                    .map_err(|e| anyhow!("failed loading {}: {}", path.display(), e))?;
                let uuid = self.lock_identity().uuid();
                Some(UserIcon::from_image(&self.conf_path, &uuid, image)?)
            }
            None => None,
        };

        self.lock_identity().set_icon(icon);

        // The icon server serves a fixed byte blob: restart the servers so
        // the advertised ports and hash stay consistent.
        if self.lock_identity().mode() == OperationalMode::Online {
            if let Some(entry) = self.current_entry.clone() {
                self.start_servers(&entry).await?;
            }
        }
        self.refresh_beacon().await;
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        info!(event = "engine_stopping", "Orchestrator stopping");

        for session in &self.sessions {
            if !session.handle.state().is_terminal() {
                session.handle.terminate();
            }
        }

        // The discovery task emits the quit beacon on its own cancellation.
        if let Some(sos) = self.discovery_sos.take() {
            sos.cancel();
        }
        if let Some(sos) = self.servers_sos.take() {
            sos.cancel();
        }

        self.registry.flush().await;
        info!(event = "engine_stopped", "Orchestrator stopped");
    }
}
