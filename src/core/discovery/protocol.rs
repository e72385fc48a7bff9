//! The discovery protocol: periodic beacon multicast and reception.
//!
//! One instance exists per active network entry; changing entry tears the
//! instance down and builds a fresh one. The sender socket is bound to the
//! entry's address so the kernel stamps the right source; the receiver joins
//! the multicast group on that interface. Own datagrams are looped back by
//! design and filtered out by source address and port.

use crate::core::config::{
    BEACON_ERROR_THRESHOLD, BEACON_INTERVAL, BEACON_TTL, DISCOVERY_GROUP, DISCOVERY_PORT,
};
use crate::core::discovery::beacon::{self, Beacon};
use crate::core::identity::OperationalMode;
use crate::core::network_entries::NetworkEntry;
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Requests posted into the discovery task.
#[derive(Debug)]
pub enum DiscoveryCommand {
    /// Switch between advertising (Online) and silence (Offline).
    SetMode(OperationalMode),
    /// Replace the advertised beacon; `None` invalidates it.
    UpdateBeacon(Option<Beacon>),
}

/// Handle to a running discovery task.
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    commands: mpsc::Sender<DiscoveryCommand>,
}

impl DiscoveryHandle {
    pub async fn set_mode(&self, mode: OperationalMode) {
        let _ = self.commands.send(DiscoveryCommand::SetMode(mode)).await;
    }

    pub async fn update_beacon(&self, beacon: Option<Beacon>) {
        let _ = self
            .commands
            .send(DiscoveryCommand::UpdateBeacon(beacon))
            .await;
    }
}

/// The discovery protocol bound to one network entry.
pub struct DiscoveryProtocol {
    sender: UdpSocket,
    receiver: UdpSocket,
    /// Local address of the sender socket, used to filter looped-back
    /// datagrams.
    local_addr: SocketAddr,

    mode: OperationalMode,
    beacon: Option<Beacon>,
    beacon_bytes: Option<Vec<u8>>,
    error_count: u32,
}

impl DiscoveryProtocol {
    /// Build the sender and receiver sockets for the given entry.
    pub fn new(entry: &NetworkEntry) -> Result<Self> {
        info!(event = "discovery_init", entry = %entry.label(), "Discovery protocol initialization");

        // Sender: bound to the entry address, TTL 1, loopback enabled.
        let sender = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed creating the sender socket")?;
        sender
            .bind(&SocketAddrV4::new(entry.ipv4, 0).into())
            .context("failed to bind the sender socket")?;
        sender.set_multicast_ttl_v4(BEACON_TTL)?;
        sender.set_multicast_loop_v4(true)?;
        sender.set_multicast_if_v4(&entry.ipv4)?;
        sender.set_nonblocking(true)?;
        let sender = UdpSocket::from_std(sender.into())?;
        let local_addr = sender.local_addr()?;

        // Receiver: bound to the protocol port with address reuse, joined to
        // the multicast group on this interface.
        let receiver = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed creating the receiver socket")?;
        receiver.set_reuse_address(true)?;
        receiver
            .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT).into())
            .context("failed to bind the receiver socket")?;
        receiver
            .join_multicast_v4(&DISCOVERY_GROUP, &entry.ipv4)
            .context("failed to join the multicast group")?;
        receiver.set_nonblocking(true)?;
        let receiver = UdpSocket::from_std(receiver.into())?;

        info!(
            event = "discovery_ready",
            local = %local_addr,
            group = %DISCOVERY_GROUP,
            port = DISCOVERY_PORT,
            "Discovery protocol initialized"
        );

        Ok(Self {
            sender,
            receiver,
            local_addr,
            mode: OperationalMode::Offline,
            beacon: None,
            beacon_bytes: None,
            error_count: 0,
        })
    }

    /// Spawn the protocol task.
    ///
    /// Received peer beacons go to `beacons_tx`; `error_tx` fires when the
    /// consecutive send-error threshold forces the protocol Offline. On
    /// cancellation the quit beacon is sent before the task ends.
    pub fn spawn(
        mut self,
        mode: OperationalMode,
        beacon: Option<Beacon>,
        beacons_tx: mpsc::Sender<Beacon>,
        error_tx: mpsc::Sender<()>,
        sos: SignalOfStop,
    ) -> DiscoveryHandle {
        let (commands_tx, mut commands_rx) = mpsc::channel(16);

        tokio::spawn(async move {
            self.update_beacon(beacon);
            self.set_mode(mode, &error_tx).await;

            let mut ticker = tokio::time::interval(BEACON_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut recv_buf = [0u8; 2048];

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.mode == OperationalMode::Online {
                            self.send_buffered_beacon(&error_tx).await;
                        }
                    }
                    received = self.receiver.recv_from(&mut recv_buf) => {
                        match received {
                            Ok((len, source)) => {
                                if let Some(beacon) = self.receive_datagram(&recv_buf[..len], source) {
                                    if beacons_tx.send(beacon).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(event = "discovery_recv_failure", error = %e, "Receiver socket error");
                            }
                        }
                    }
                    command = commands_rx.recv() => {
                        match command {
                            Some(DiscoveryCommand::SetMode(mode)) => {
                                self.set_mode(mode, &error_tx).await;
                            }
                            Some(DiscoveryCommand::UpdateBeacon(beacon)) => {
                                self.update_beacon(beacon);
                            }
                            None => break,
                        }
                    }
                    _ = sos.wait() => break,
                }
            }

            // Polite shutdown: advertise the quit beacon first.
            self.set_mode(OperationalMode::Offline, &error_tx).await;
            info!(event = "discovery_stopped", "Discovery protocol stopped");
        });

        DiscoveryHandle {
            commands: commands_tx,
        }
    }

    fn update_beacon(&mut self, beacon: Option<Beacon>) {
        self.beacon_bytes = beacon.as_ref().and_then(|b| match b.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(event = "beacon_encode_failure", error = %e, "Invalid beacon for output");
                None
            }
        });
        self.beacon = beacon;
        info!(event = "beacon_updated", "Local beacon updated");
    }

    async fn set_mode(&mut self, mode: OperationalMode, error_tx: &mpsc::Sender<()>) {
        if self.mode == mode {
            return;
        }

        match mode {
            OperationalMode::Online => {
                if self.beacon_bytes.is_none() {
                    error!(event = "discovery_online_failure", "Failed going online, invalid beacon");
                    return;
                }
            }
            OperationalMode::Offline => {
                self.send_quit_beacon(error_tx).await;
            }
        }

        self.error_count = 0;
        self.mode = mode;
        info!(event = "discovery_mode_changed", mode = ?mode, "Discovery mode changed");
    }

    /// Send the buffered beacon; on the error threshold go Offline and
    /// notify.
    async fn send_buffered_beacon(&mut self, error_tx: &mpsc::Sender<()>) {
        let Some(bytes) = self.beacon_bytes.clone() else {
            error!(event = "beacon_missing", "Invalid beacon detected for output");
            self.set_mode(OperationalMode::Offline, error_tx).await;
            return;
        };
        self.send_datagram(&bytes, error_tx).await;
    }

    /// Advertise one last beacon with the quit flag so peers expire the
    /// local record faster than through aging.
    async fn send_quit_beacon(&mut self, error_tx: &mpsc::Sender<()>) {
        if self.error_count >= BEACON_ERROR_THRESHOLD {
            return;
        }
        let Some(beacon) = &self.beacon else {
            return;
        };
        match beacon.quitting().encode() {
            Ok(bytes) => {
                info!(event = "quit_beacon", "Sending quit beacon");
                self.send_datagram(&bytes, error_tx).await;
            }
            Err(e) => warn!(event = "beacon_encode_failure", error = %e, "Invalid quit beacon"),
        }
    }

    async fn send_datagram(&mut self, bytes: &[u8], error_tx: &mpsc::Sender<()>) {
        let target = SocketAddrV4::new(DISCOVERY_GROUP, DISCOVERY_PORT);
        match self.sender.send_to(bytes, target).await {
            Ok(sent) if sent == bytes.len() => {
                self.error_count = 0;
            }
            result => {
                if let Err(e) = result {
                    warn!(event = "beacon_send_failure", error = %e, "Error while sending a beacon");
                } else {
                    warn!(event = "beacon_send_failure", "Short beacon write");
                }
                self.error_count += 1;
                if self.error_count == BEACON_ERROR_THRESHOLD {
                    error!(event = "discovery_error", "Beacon error threshold reached");
                    self.mode = OperationalMode::Offline;
                    let _ = error_tx.send(()).await;
                }
            }
        }
    }

    /// Validate and decode one received datagram, filtering out our own
    /// looped-back beacons.
    fn receive_datagram(&self, data: &[u8], source: SocketAddr) -> Option<Beacon> {
        if data.len() < beacon::MIN_SIZE || data.len() > beacon::MAX_SIZE {
            warn!(
                event = "beacon_wrong_size",
                source = %source,
                size = data.len(),
                "Wrong sized datagram received"
            );
            return None;
        }

        if source == self.local_addr {
            return None;
        }

        match Beacon::decode(data) {
            Ok(beacon) => Some(beacon),
            Err(e) => {
                warn!(event = "beacon_invalid", source = %source, error = %e, "Invalid datagram received");
                None
            }
        }
    }
}
