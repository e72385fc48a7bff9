//! Avatar icons.
//!
//! An icon is a 128×128 JPEG of at most 16 KiB, identified by the SHA-1 hash
//! of its bytes. Icons are cached on disk under `<conf>/icons/<uuid>.jpg`;
//! every cache file access happens under an advisory sibling lock so a
//! concurrent picker or UI process never observes a half-written image.

use crate::core::config::{ICON_MAX_SIZE_BYTES, ICON_SIZE_PX};
use crate::core::discovery::beacon::HASH_LEN;
use crate::utils::atomic_write::atomic_write;
use crate::utils::lock::FileLockGuard;
use anyhow::{anyhow, bail, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageFormat;
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// A validated avatar icon backed by its cache file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIcon {
    hash: [u8; HASH_LEN],
    path: PathBuf,
}

/// The on-disk cache location for a user's icon.
pub fn cache_path(conf_path: &Path, uuid: &Uuid) -> PathBuf {
    conf_path.join("icons").join(format!("{}.jpg", uuid))
}

/// Validate raw icon bytes: size cap, optional expected hash, JPEG decoding
/// to exactly 128×128. Returns the computed hash.
fn validate_bytes(data: &[u8], expected_hash: Option<&[u8; HASH_LEN]>) -> Result<[u8; HASH_LEN]> {
    if data.is_empty() {
        bail!("no icon data available");
    }
    if data.len() > ICON_MAX_SIZE_BYTES as usize {
        bail!("icon too big ({} bytes)", data.len());
    }

    let hash: [u8; HASH_LEN] = Sha1::digest(data).into();
    if let Some(expected) = expected_hash {
        if hash != *expected {
            bail!("icon SHA-1 hash different from expected");
        }
    }

    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| anyhow!("not a valid icon image: {}", e))?;
    if image.width() != ICON_SIZE_PX || image.height() != ICON_SIZE_PX {
        bail!(
            "wrong icon dimensions {}x{}",
            image.width(),
            image.height()
        );
    }

    Ok(hash)
}

impl UserIcon {
    /// SHA-1 hash of the icon bytes.
    pub fn hash(&self) -> &[u8; HASH_LEN] {
        &self.hash
    }

    /// Path of the cache file backing this icon.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Build an icon from bytes received over the network: validate against
    /// the advertised hash and persist to the cache under the file lock.
    pub fn from_network(
        conf_path: &Path,
        uuid: &Uuid,
        data: &[u8],
        expected_hash: &[u8; HASH_LEN],
    ) -> Result<Self> {
        let hash = validate_bytes(data, Some(expected_hash))?;
        let path = cache_path(conf_path, uuid);

        let _guard = FileLockGuard::lock(&path)?;
        atomic_write(&path, data)?;
        info!(event = "icon_saved", path = %path.display(), bytes = data.len(), "Icon saved to cache");

        Ok(Self { hash, path })
    }

    /// Load a cached icon, verifying it still matches the recorded hash.
    pub fn from_cache(conf_path: &Path, uuid: &Uuid, expected_hash: &[u8; HASH_LEN]) -> Result<Self> {
        let path = cache_path(conf_path, uuid);
        let data = {
            let _guard = FileLockGuard::lock(&path)?;
            std::fs::read(&path)?
        };
        let hash = validate_bytes(&data, Some(expected_hash))?;
        Ok(Self { hash, path })
    }

    /// Build the local user's icon from an arbitrary image: scale and
    /// center-crop to 128×128, encode as JPEG and persist to the cache.
    pub fn from_image(conf_path: &Path, uuid: &Uuid, image: image::DynamicImage) -> Result<Self> {
        let resized = image.resize_to_fill(ICON_SIZE_PX, ICON_SIZE_PX, FilterType::Lanczos3);

        let mut data = Vec::new();
        let mut quality = 90u8;
        loop {
            data.clear();
            let encoder = JpegEncoder::new_with_quality(&mut data, quality);
            resized
                .to_rgb8()
                .write_with_encoder(encoder)
                .map_err(|e| anyhow!("failed encoding icon: {}", e))?;

            if data.len() <= ICON_MAX_SIZE_BYTES as usize {
                break;
            }
            if quality <= 30 {
                bail!("icon does not fit in {} bytes", ICON_MAX_SIZE_BYTES);
            }
            quality -= 20;
        }

        let hash: [u8; HASH_LEN] = Sha1::digest(&data).into();
        let path = cache_path(conf_path, uuid);

        let _guard = FileLockGuard::lock(&path)?;
        atomic_write(&path, &data)?;
        info!(event = "icon_saved", path = %path.display(), bytes = data.len(), "Icon saved to cache");

        Ok(Self { hash, path })
    }

    /// Read the cached bytes back for serving, verifying the hash.
    pub fn read_data(&self) -> Result<Vec<u8>> {
        let data = {
            let _guard = FileLockGuard::lock(&self.path)?;
            std::fs::read(&self.path)?
        };
        if validate_bytes(&data, Some(&self.hash)).is_err() {
            warn!(
                event = "icon_cache_corrupted",
                path = %self.path.display(),
                "Cached icon no longer matches its hash"
            );
            bail!("cached icon corrupted");
        }
        Ok(data)
    }

    /// Remove the cache file (icon removed or replaced).
    pub fn remove_cache(&self) {
        if let Ok(_guard) = FileLockGuard::lock(&self.path) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Parse a hex-encoded icon hash from persisted state.
pub fn hash_from_hex(hex: &str) -> Option<[u8; HASH_LEN]> {
    if hex.len() != HASH_LEN * 2 {
        return None;
    }
    let mut hash = [0u8; HASH_LEN];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)?;
        let low = (chunk[1] as char).to_digit(16)?;
        hash[i] = (high * 16 + low) as u8;
    }
    Some(hash)
}

/// Hex-encode an icon hash for persisted state.
pub fn hash_to_hex(hash: &[u8; HASH_LEN]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            image::Rgb([120, 30, 200]),
        ));
        let mut data = Vec::new();
        let encoder = JpegEncoder::new_with_quality(&mut data, 85);
        image.to_rgb8().write_with_encoder(encoder).unwrap();
        data
    }

    #[test]
    fn test_validate_accepts_expected_icon() {
        let data = jpeg_bytes(ICON_SIZE_PX, ICON_SIZE_PX);
        let hash: [u8; HASH_LEN] = Sha1::digest(&data).into();
        assert_eq!(validate_bytes(&data, Some(&hash)).unwrap(), hash);
    }

    #[test]
    fn test_validate_rejects_wrong_hash() {
        let data = jpeg_bytes(ICON_SIZE_PX, ICON_SIZE_PX);
        let wrong = [0u8; HASH_LEN];
        assert!(validate_bytes(&data, Some(&wrong)).is_err());
    }

    #[test]
    fn test_validate_rejects_wrong_dimensions() {
        let data = jpeg_bytes(64, 64);
        assert!(validate_bytes(&data, None).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_data() {
        let data = vec![0u8; ICON_MAX_SIZE_BYTES as usize + 1];
        assert!(validate_bytes(&data, None).is_err());
    }

    #[test]
    fn test_network_icon_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let data = jpeg_bytes(ICON_SIZE_PX, ICON_SIZE_PX);
        let hash: [u8; HASH_LEN] = Sha1::digest(&data).into();

        let icon = UserIcon::from_network(dir.path(), &uuid, &data, &hash).unwrap();
        assert_eq!(icon.hash(), &hash);
        assert_eq!(icon.read_data().unwrap(), data);

        let reloaded = UserIcon::from_cache(dir.path(), &uuid, &hash).unwrap();
        assert_eq!(reloaded.hash(), &hash);
    }

    #[test]
    fn test_from_image_normalizes_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let big = DynamicImage::ImageRgb8(RgbImage::from_pixel(640, 480, image::Rgb([9, 9, 9])));

        let icon = UserIcon::from_image(dir.path(), &uuid, big).unwrap();
        let data = icon.read_data().unwrap();
        let decoded = image::load_from_memory_with_format(&data, ImageFormat::Jpeg).unwrap();
        assert_eq!(decoded.width(), ICON_SIZE_PX);
        assert_eq!(decoded.height(), ICON_SIZE_PX);
        assert!(data.len() <= ICON_MAX_SIZE_BYTES as usize);
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let hash = [0x5Au8; HASH_LEN];
        let hex = hash_to_hex(&hash);
        assert_eq!(hex.len(), HASH_LEN * 2);
        assert_eq!(hash_from_hex(&hex), Some(hash));
        assert_eq!(hash_from_hex("zz"), None);
    }
}
