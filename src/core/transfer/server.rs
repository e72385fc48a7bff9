//! The file-transfer TCP server.
//!
//! Bound on the discovery-advertised IPv4 with an OS-chosen port. Accepted
//! connections are handed to the orchestrator, which wires the decision
//! channels and spawns the receiver session.

use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An accepted inbound connection awaiting session wiring.
#[derive(Debug)]
pub struct InboundConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

/// Listening server handing inbound connections to the orchestrator.
pub struct TransferServer {
    listener: TcpListener,
    port: u16,
}

impl TransferServer {
    /// Bind on `ipv4` with an OS-chosen port.
    pub async fn bind(ipv4: Ipv4Addr) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(ipv4, 0))
            .await
            .context("failed to bind the file-transfer server")?;
        let port = listener.local_addr()?.port();
        info!(event = "ft_server_started", address = %ipv4, port, "File-transfer server listening");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until cancelled, forwarding them to `inbound_tx`.
    pub async fn run(self, inbound_tx: mpsc::Sender<InboundConnection>, sos: SignalOfStop) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        info!(event = "ft_connection_accepted", peer = %peer_addr, "Inbound transfer connection");
                        if inbound_tx
                            .send(InboundConnection { stream, peer_addr })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(event = "ft_accept_failure", error = %e, "Error accepting a connection");
                    }
                },
                _ = sos.wait() => {
                    info!(event = "ft_server_stopped", "File-transfer server stopped");
                    return;
                }
            }
        }
    }
}
