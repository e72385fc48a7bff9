//! The icon server.
//!
//! Serves the local avatar to whoever connects: a 4-byte little-endian
//! length followed by the raw JPEG bytes, then the connection is closed.
//! Idle when no icon is set (the server is simply not started).

use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Listening server handing out the local icon bytes.
pub struct IconServer {
    listener: TcpListener,
    port: u16,
}

impl IconServer {
    /// Bind on `ipv4` with an OS-chosen port.
    pub async fn bind(ipv4: Ipv4Addr) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(ipv4, 0))
            .await
            .context("failed to bind the icon server")?;
        let port = listener.local_addr()?.port();
        info!(event = "icon_server_started", address = %ipv4, port, "Icon server listening");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve `icon_data` to every client until cancelled.
    pub async fn run(self, icon_data: Vec<u8>, sos: SignalOfStop) {
        let icon_data = Arc::new(icon_data);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((mut stream, peer)) => {
                        let icon_data = Arc::clone(&icon_data);
                        tokio::spawn(async move {
                            let length = (icon_data.len() as u32).to_le_bytes();
                            let result = async {
                                stream.write_all(&length).await?;
                                stream.write_all(&icon_data).await?;
                                stream.shutdown().await
                            }
                            .await;

                            match result {
                                Ok(()) => {
                                    info!(event = "icon_sent", peer = %peer, "Icon sent")
                                }
                                Err(e) => {
                                    warn!(event = "icon_send_failure", peer = %peer, error = %e, "Failed sending the icon")
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!(event = "icon_accept_failure", error = %e, "Error accepting an icon request");
                    }
                },
                _ = sos.wait() => {
                    info!(event = "icon_server_stopped", "Icon server stopped");
                    return;
                }
            }
        }
    }
}
