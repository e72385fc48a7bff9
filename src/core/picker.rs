//! Picker ingress.
//!
//! The out-of-process file picker hands its selection over a local socket
//! (Unix domain socket on POSIX, named pipe on Windows): a 4-byte count
//! followed by that many length-prefixed UTF-8 absolute paths. Malformed
//! framing closes the connection silently; a well-formed list is forwarded
//! to the orchestrator.

use crate::core::config::{PICKER_SOCKET_NAME, PICKER_TIMEOUT};
use crate::core::transfer::wire;
use crate::utils::sos::SignalOfStop;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Upper bound on the number of paths per connection.
const MAX_PATHS: u32 = 64 * 1024;

/// Read the framed path list from one picker connection.
async fn read_paths<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<PathBuf>> {
    let count = reader.read_u32_le().await?;
    if count == 0 || count > MAX_PATHS {
        bail!("unreasonable path count {}", count);
    }

    let mut paths = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let path = wire::read_string(reader).await?;
        paths.push(PathBuf::from(path));
    }
    Ok(paths)
}

async fn handle_connection<R: AsyncRead + Unpin>(
    mut reader: R,
    paths_tx: mpsc::Sender<Vec<PathBuf>>,
) {
    match tokio::time::timeout(PICKER_TIMEOUT, read_paths(&mut reader)).await {
        Ok(Ok(paths)) => {
            info!(event = "picker_paths_received", count = paths.len(), "Paths received from the picker");
            let _ = paths_tx.send(paths).await;
        }
        Ok(Err(e)) => {
            debug!(event = "picker_malformed", error = %e, "Malformed picker connection closed");
        }
        Err(_) => {
            warn!(event = "picker_timeout", "Picker connection timed out");
        }
    }
}

/// Start the picker server. Failure to bind is fatal for the daemon.
#[cfg(unix)]
pub fn start(paths_tx: mpsc::Sender<Vec<PathBuf>>, sos: SignalOfStop) -> Result<()> {
    let socket_path = std::env::temp_dir().join(PICKER_SOCKET_NAME);

    // Remove a stale endpoint left behind by a crashed instance.
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed removing stale socket {}", socket_path.display()))?;
    }

    let listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind the picker socket {}", socket_path.display()))?;
    info!(event = "picker_started", path = %socket_path.display(), "Picker server listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let paths_tx = paths_tx.clone();
                        tokio::spawn(handle_connection(stream, paths_tx));
                    }
                    Err(e) => {
                        warn!(event = "picker_accept_failure", error = %e, "Error accepting a picker connection");
                    }
                },
                _ = sos.wait() => {
                    info!(event = "picker_stopped", "Picker server stopped");
                    let _ = std::fs::remove_file(&socket_path);
                    return;
                }
            }
        }
    });

    Ok(())
}

/// Start the picker server. Failure to bind is fatal for the daemon.
#[cfg(windows)]
pub fn start(paths_tx: mpsc::Sender<Vec<PathBuf>>, sos: SignalOfStop) -> Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let pipe_name = format!(r"\\.\pipe\{}", PICKER_SOCKET_NAME);
    let mut server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(&pipe_name)
        .with_context(|| format!("failed to create the picker pipe {}", pipe_name))?;
    info!(event = "picker_started", path = %pipe_name, "Picker server listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                connected = server.connect() => {
                    if let Err(e) = connected {
                        warn!(event = "picker_accept_failure", error = %e, "Error accepting a picker connection");
                        continue;
                    }
                    let next = match ServerOptions::new().create(&pipe_name) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!(event = "picker_accept_failure", error = %e, "Failed to recreate the picker pipe");
                            return;
                        }
                    };
                    let connected_pipe = std::mem::replace(&mut server, next);
                    let paths_tx = paths_tx.clone();
                    tokio::spawn(handle_connection(connected_pipe, paths_tx));
                }
                _ = sos.wait() => {
                    info!(event = "picker_stopped", "Picker server stopped");
                    return;
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn frame(paths: &[&str]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(paths.len() as u32);
        for path in paths {
            buf.put_u32_le(path.len() as u32);
            buf.put_slice(path.as_bytes());
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_read_paths() {
        let data = frame(&["/home/u/a.txt", "/home/u/dir"]);
        let mut reader = &data[..];
        let paths = read_paths(&mut reader).await.unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/home/u/a.txt"), PathBuf::from("/home/u/dir")]
        );
    }

    #[tokio::test]
    async fn test_read_paths_rejects_zero_count() {
        let data = frame(&[]);
        let mut reader = &data[..];
        assert!(read_paths(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_read_paths_rejects_truncated() {
        let mut data = frame(&["/home/u/a.txt"]);
        data.truncate(data.len() - 3);
        let mut reader = &data[..];
        assert!(read_paths(&mut reader).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_round_trip() {
        use tokio::io::AsyncWriteExt;

        // Bind on a scratch path to keep the test isolated.
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("picker.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
        let (paths_tx, mut paths_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_connection(stream, paths_tx).await;
        });

        let mut client = tokio::net::UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(&frame(&["/tmp/x"])).await.unwrap();
        client.shutdown().await.unwrap();

        let received = paths_rx.recv().await.unwrap();
        assert_eq!(received, vec![PathBuf::from("/tmp/x")]);
    }
}
