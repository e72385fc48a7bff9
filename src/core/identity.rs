//! The local user identity.
//!
//! Created once from the environment username on first run and persisted to
//! `<conf>/me.json` on every change. The UUID is regenerated when a beacon
//! with the same UUID is observed on the network (collision detection).

use crate::core::discovery::beacon::{Beacon, NAME_MAX_CHARS};
use crate::core::icon::{self, UserIcon};
use crate::core::reception::ReceptionPolicy;
use crate::utils::atomic_write::atomic_write;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Sentinel shown when the user has no name at all.
pub const NO_NAME: &str = "*** NO NAME ***";

/// The all-zero UUID placed on the wire by an Offline initiator.
pub const ANONYMOUS_UUID: Uuid = Uuid::nil();

/// Whether the daemon advertises itself on the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationalMode {
    /// Advertised: peers can discover the local user and send files.
    Online,
    /// Not advertised: the local user can only initiate transfers.
    Offline,
}

/// Truncate a name to the maximum length allowed on the wire, counted in
/// UTF-16 code units and never splitting a surrogate pair.
fn trim_name(name: &str) -> String {
    let mut units = 0;
    name.chars()
        .take_while(|c| {
            units += c.len_utf16();
            units <= NAME_MAX_CHARS
        })
        .collect()
}

/// The username stored in the environment, as a default first name.
fn env_user_name() -> String {
    let name = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    if name.is_empty() {
        NO_NAME.to_string()
    } else {
        trim_name(&name)
    }
}

// ── Persisted form ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    uuid: Uuid,
    first_name: String,
    last_name: String,
    #[serde(default)]
    icon_hash: Option<String>,
    #[serde(default)]
    policy: ReceptionPolicy,
}

// ── Local identity ───────────────────────────────────────────────────────────

/// The local user: persistent fields plus the current network bindings.
#[derive(Debug)]
pub struct LocalIdentity {
    uuid: Uuid,
    first_name: String,
    last_name: String,
    icon: Option<UserIcon>,
    policy: ReceptionPolicy,
    mode: OperationalMode,

    /// IPv4 the servers are currently bound to, if any.
    pub bound_ipv4: Option<Ipv4Addr>,
    /// Port of the running file-transfer server, if any.
    pub ft_port: Option<u16>,
    /// Port of the running icon server, if any.
    pub it_port: Option<u16>,

    me_path: PathBuf,
}

impl LocalIdentity {
    /// Load the identity from `<conf>/me.json`, or create a fresh one.
    pub fn load_or_create(conf_path: &Path, data_path: &Path) -> Self {
        let me_path = conf_path.join("me.json");

        let loaded = std::fs::read_to_string(&me_path)
            .context("read")
            .and_then(|content| serde_json::from_str::<IdentityFile>(&content).context("parse"));

        let mut identity = match loaded {
            Ok(file) => {
                let icon = file.icon_hash.as_deref().and_then(|hex| {
                    let hash = icon::hash_from_hex(hex)?;
                    match UserIcon::from_cache(conf_path, &file.uuid, &hash) {
                        Ok(icon) => Some(icon),
                        Err(e) => {
                            warn!(event = "icon_cache_miss", error = %e, "Stored icon could not be loaded, dropping it");
                            None
                        }
                    }
                });

                let mut first_name = trim_name(&file.first_name);
                let last_name = trim_name(&file.last_name);
                if first_name.is_empty() && last_name.is_empty() {
                    first_name = NO_NAME.to_string();
                }

                let policy = if file.policy.use_defaults {
                    ReceptionPolicy::defaults(data_path)
                } else {
                    file.policy
                };

                Self {
                    uuid: file.uuid,
                    first_name,
                    last_name,
                    icon,
                    policy,
                    mode: OperationalMode::Offline,
                    bound_ipv4: None,
                    ft_port: None,
                    it_port: None,
                    me_path,
                }
            }
            Err(e) => {
                info!(event = "identity_created", error = %e, "No usable identity on disk, creating a new one");
                Self {
                    uuid: Uuid::new_v4(),
                    first_name: env_user_name(),
                    last_name: String::new(),
                    icon: None,
                    policy: ReceptionPolicy::defaults(data_path),
                    mode: OperationalMode::Offline,
                    bound_ipv4: None,
                    ft_port: None,
                    it_port: None,
                    me_path,
                }
            }
        };

        identity.save();
        info!(
            event = "identity_loaded",
            uuid = %identity.uuid,
            first_name = %identity.first_name,
            last_name = %identity.last_name,
            "Local identity ready"
        );
        identity
    }

    /// Persist the identity to `me.json`.
    pub fn save(&mut self) {
        let file = IdentityFile {
            uuid: self.uuid,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            icon_hash: self.icon.as_ref().map(|i| icon::hash_to_hex(i.hash())),
            policy: self.policy.clone(),
        };

        match serde_json::to_string_pretty(&file) {
            Ok(content) => {
                if let Err(e) = atomic_write(&self.me_path, content.as_bytes()) {
                    error!(event = "identity_save_failure", error = %e, "Failed saving identity");
                }
            }
            Err(e) => error!(event = "identity_save_failure", error = %e, "Failed serializing identity"),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn first_name(&self) -> &str {
        &self.first_name
    }

    pub fn last_name(&self) -> &str {
        &self.last_name
    }

    /// First and last name joined for display and destination folders.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    pub fn icon(&self) -> Option<&UserIcon> {
        self.icon.as_ref()
    }

    pub fn policy(&self) -> &ReceptionPolicy {
        &self.policy
    }

    pub fn mode(&self) -> OperationalMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OperationalMode) {
        self.mode = mode;
    }

    /// Update the names. Both trimmed names empty is rejected and the
    /// previous values are kept.
    pub fn set_names(&mut self, first: &str, last: &str) -> Result<bool> {
        let first = trim_name(first);
        let last = trim_name(last);
        if first.is_empty() && last.is_empty() {
            bail!("both names empty");
        }
        if first == self.first_name && last == self.last_name {
            return Ok(false);
        }

        self.first_name = first;
        self.last_name = last;
        info!(
            event = "identity_renamed",
            uuid = %self.uuid,
            first_name = %self.first_name,
            last_name = %self.last_name,
            "Local names updated"
        );
        self.save();
        Ok(true)
    }

    /// Replace or remove the local icon.
    pub fn set_icon(&mut self, icon: Option<UserIcon>) {
        if let (None, Some(old)) = (&icon, &self.icon) {
            old.remove_cache();
        }
        self.icon = icon;
        self.save();
    }

    pub fn set_policy(&mut self, policy: ReceptionPolicy, data_path: &Path) {
        self.policy = if policy.use_defaults {
            ReceptionPolicy::defaults(data_path)
        } else {
            policy
        };
        self.save();
    }

    /// Generate a fresh UUID, avoiding every value in `used`.
    pub fn regenerate_uuid(&mut self, used: &[Uuid]) {
        let previous = self.uuid;
        let mut fresh = Uuid::new_v4();
        while fresh == previous || used.contains(&fresh) {
            fresh = Uuid::new_v4();
        }
        self.uuid = fresh;
        error!(
            event = "uuid_reset",
            previous = %previous,
            current = %self.uuid,
            "Duplicated UUID detected, local UUID regenerated"
        );
        self.save();
    }

    /// Build the discovery beacon advertising this identity. Fails when the
    /// network bindings are incomplete or the fields would make an invalid
    /// beacon.
    pub fn beacon(&self) -> Result<Beacon> {
        let Some(ipv4) = self.bound_ipv4 else {
            bail!("no bound address");
        };
        let Some(ft_port) = self.ft_port else {
            bail!("file-transfer server not running");
        };

        let (icon_hash, it_port) = match (&self.icon, self.it_port) {
            (Some(icon), Some(port)) => (Some(*icon.hash()), port),
            _ => (None, 0),
        };

        let beacon = Beacon {
            uuid: self.uuid,
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            ipv4,
            ft_port,
            it_port,
            icon_hash,
            quit: false,
        };
        // Surface invalid combinations now rather than at send time.
        beacon.encode()?;
        Ok(beacon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("inbox");

        let identity = {
            let mut identity = LocalIdentity::load_or_create(dir.path(), &data);
            identity.set_names("Ada", "Lovelace").unwrap();
            identity.uuid()
        };

        let reloaded = LocalIdentity::load_or_create(dir.path(), &data);
        assert_eq!(reloaded.uuid(), identity);
        assert_eq!(reloaded.first_name(), "Ada");
        assert_eq!(reloaded.display_name(), "Ada Lovelace");
    }

    #[test]
    fn test_both_names_empty_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = LocalIdentity::load_or_create(dir.path(), dir.path());
        identity.set_names("Ada", "").unwrap();

        assert!(identity.set_names("", "").is_err());
        assert_eq!(identity.first_name(), "Ada");
    }

    #[test]
    fn test_names_trimmed_to_wire_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = LocalIdentity::load_or_create(dir.path(), dir.path());
        identity
            .set_names("aaaaaaaaaaaaaaaaaaaaaaaa", "b")
            .unwrap();
        assert_eq!(identity.first_name().chars().count(), NAME_MAX_CHARS);
    }

    #[test]
    fn test_names_trimmed_in_utf16_units() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = LocalIdentity::load_or_create(dir.path(), dir.path());

        // Nine astral characters are eighteen UTF-16 code units; the trim
        // keeps whole characters and stays within the unit budget.
        identity.set_names(&"🦀".repeat(9), "b").unwrap();
        assert_eq!(identity.first_name().chars().count(), NAME_MAX_CHARS / 2);
        assert_eq!(
            identity.first_name().encode_utf16().count(),
            NAME_MAX_CHARS
        );

        // The trimmed name must survive beacon validation.
        identity.bound_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 2));
        identity.ft_port = Some(40001);
        assert!(identity.beacon().is_ok());
    }

    #[test]
    fn test_regenerate_uuid_avoids_used() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = LocalIdentity::load_or_create(dir.path(), dir.path());
        let old = identity.uuid();

        identity.regenerate_uuid(&[old]);
        assert_ne!(identity.uuid(), old);
    }

    #[test]
    fn test_beacon_requires_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let mut identity = LocalIdentity::load_or_create(dir.path(), dir.path());
        assert!(identity.beacon().is_err());

        identity.bound_ipv4 = Some(Ipv4Addr::new(10, 0, 0, 2));
        identity.ft_port = Some(40001);
        let beacon = identity.beacon().unwrap();
        assert_eq!(beacon.uuid, identity.uuid());
        assert_eq!(beacon.it_port, 0);
        assert!(beacon.icon_hash.is_none());
        assert!(!beacon.quit);
    }

    #[test]
    fn test_corrupted_file_recreates_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("me.json"), "not json").unwrap();

        let identity = LocalIdentity::load_or_create(dir.path(), dir.path());
        assert!(!identity.uuid().is_nil());
    }
}
