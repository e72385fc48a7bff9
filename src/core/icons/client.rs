//! The icon fetch client.
//!
//! One fetch task runs per peer whose beacon advertises an icon hash the
//! local cache does not have. Each attempt is bounded by a request timeout;
//! failures are retried with an exponentially backed-off delay, clamped to
//! a sane maximum. The task ends on success or when cancelled (peer gone,
//! hash changed, shutdown).

use crate::core::config::{
    ICON_INITIAL_RETRY, ICON_MAX_RETRY, ICON_MAX_SIZE_BYTES, ICON_REQUEST_TIMEOUT,
};
use crate::core::discovery::beacon::HASH_LEN;
use crate::core::icon::UserIcon;
use crate::utils::sos::SignalOfStop;
use anyhow::{bail, Result};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Parameters of one icon fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconFetch {
    pub peer_uuid: Uuid,
    pub ipv4: Ipv4Addr,
    pub port: u16,
    pub hash: [u8; HASH_LEN],
}

/// Spawn the fetch-with-retry task; the validated icon is reported through
/// `results_tx`. Dropping via `sos` cancels pending retries.
pub fn spawn_fetch(
    conf_path: PathBuf,
    fetch: IconFetch,
    results_tx: mpsc::Sender<(Uuid, UserIcon)>,
    sos: SignalOfStop,
) {
    tokio::spawn(async move {
        let mut retry_delay = ICON_INITIAL_RETRY;

        loop {
            let attempt = tokio::time::timeout(ICON_REQUEST_TIMEOUT, request(&conf_path, &fetch));
            match attempt.await {
                Ok(Ok(icon)) => {
                    info!(event = "icon_fetched", peer = %fetch.peer_uuid, "Icon request completed");
                    let _ = results_tx.send((fetch.peer_uuid, icon)).await;
                    return;
                }
                Ok(Err(e)) => {
                    warn!(event = "icon_fetch_failure", peer = %fetch.peer_uuid, error = %e, "Icon request failed");
                }
                Err(_) => {
                    warn!(event = "icon_fetch_timeout", peer = %fetch.peer_uuid, "Icon request timed out");
                }
            }

            if sos.select(tokio::time::sleep(retry_delay)).await.is_err() {
                return;
            }
            retry_delay = (retry_delay * 2).min(ICON_MAX_RETRY);
        }
    });
}

/// One fetch attempt: connect, read the length-prefixed bytes, validate and
/// persist to the cache.
async fn request(conf_path: &std::path::Path, fetch: &IconFetch) -> Result<UserIcon> {
    let mut stream = TcpStream::connect(SocketAddrV4::new(fetch.ipv4, fetch.port)).await?;

    let length = stream.read_u32_le().await?;
    if length > ICON_MAX_SIZE_BYTES {
        bail!("too big icon advertised ({} bytes)", length);
    }

    let mut data = vec![0u8; length as usize];
    stream.read_exact(&mut data).await?;

    UserIcon::from_network(conf_path, &fetch.peer_uuid, &data, &fetch.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::icons::server::IconServer;
    use image::codecs::jpeg::JpegEncoder;
    use sha1::{Digest, Sha1};

    fn sample_icon() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(128, 128, image::Rgb([10, 20, 30]));
        let mut data = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut data, 85);
        image.write_with_encoder(encoder).unwrap();
        data
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_icon();
        let hash: [u8; HASH_LEN] = Sha1::digest(&data).into();

        let server = IconServer::bind(Ipv4Addr::LOCALHOST).await.unwrap();
        let port = server.port();
        let sos = SignalOfStop::new();
        tokio::spawn(server.run(data.clone(), sos.clone()));

        let uuid = Uuid::new_v4();
        let fetch = IconFetch {
            peer_uuid: uuid,
            ipv4: Ipv4Addr::LOCALHOST,
            port,
            hash,
        };
        let (results_tx, mut results_rx) = mpsc::channel(1);
        spawn_fetch(dir.path().to_path_buf(), fetch, results_tx, sos.clone());

        let (fetched_uuid, icon) = results_rx.recv().await.unwrap();
        assert_eq!(fetched_uuid, uuid);
        assert_eq!(icon.hash(), &hash);
        assert_eq!(icon.read_data().unwrap(), data);
        sos.cancel();
    }

    #[tokio::test]
    async fn test_hash_mismatch_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_icon();

        let server = IconServer::bind(Ipv4Addr::LOCALHOST).await.unwrap();
        let port = server.port();
        let sos = SignalOfStop::new();
        tokio::spawn(server.run(data, sos.clone()));

        let fetch = IconFetch {
            peer_uuid: Uuid::new_v4(),
            ipv4: Ipv4Addr::LOCALHOST,
            port,
            hash: [0u8; HASH_LEN],
        };
        let (results_tx, mut results_rx) = mpsc::channel(1);
        spawn_fetch(dir.path().to_path_buf(), fetch, results_tx, sos.clone());

        // The mismatch schedules a retry instead of reporting a result.
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(300), results_rx.recv()).await;
        assert!(waited.is_err());
        sos.cancel();
    }
}
