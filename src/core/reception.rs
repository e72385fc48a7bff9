//! Reception policies.
//!
//! A policy decides what happens when a sharing request arrives from a peer:
//! ask the user, auto-accept into a configured directory, or auto-reject.
//! Each peer may carry an override; a policy with `use_defaults` set defers
//! to the local default policy.

use chrono::Local;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The action taken when a new sharing request is received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceptionAction {
    /// Ask the user which action is to be performed.
    #[default]
    Ask,
    /// Automatically accept all transfers.
    Accept,
    /// Automatically reject all transfers.
    Reject,
}

/// Preferences regarding file reception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceptionPolicy {
    /// When set, the local default policy applies instead of this one.
    pub use_defaults: bool,
    pub action: ReceptionAction,
    /// Base directory received files are stored under.
    pub base_path: PathBuf,
    /// Nest received files under a folder named after the sender.
    pub append_sender_folder: bool,
    /// Nest received files under a folder named after the current date.
    pub append_date_folder: bool,
}

impl Default for ReceptionPolicy {
    fn default() -> Self {
        Self {
            use_defaults: true,
            action: ReceptionAction::Ask,
            base_path: PathBuf::new(),
            append_sender_folder: false,
            append_date_folder: false,
        }
    }
}

impl ReceptionPolicy {
    /// The concrete default policy rooted at the given data directory.
    pub fn defaults(data_path: &Path) -> Self {
        Self {
            use_defaults: false,
            action: ReceptionAction::Ask,
            base_path: data_path.to_path_buf(),
            append_sender_folder: false,
            append_date_folder: false,
        }
    }

    /// Resolve this policy against the local default.
    pub fn resolve<'a>(&'a self, default: &'a ReceptionPolicy) -> &'a ReceptionPolicy {
        if self.use_defaults {
            default
        } else {
            self
        }
    }

    /// The destination directory for files received from `sender_name`,
    /// applying the optional sender and date sub-folders.
    pub fn destination(&self, sender_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        if self.append_sender_folder && !sender_name.is_empty() {
            path.push(sender_name);
        }
        if self.append_date_folder {
            path.push(Local::now().format("%Y%m%d").to_string());
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_override() {
        let default = ReceptionPolicy::defaults(Path::new("/data"));
        let mut specific = ReceptionPolicy::defaults(Path::new("/custom"));
        specific.action = ReceptionAction::Accept;

        assert_eq!(specific.resolve(&default).base_path, Path::new("/custom"));

        let deferring = ReceptionPolicy::default();
        assert_eq!(deferring.resolve(&default).base_path, Path::new("/data"));
    }

    #[test]
    fn test_destination_subfolders() {
        let mut policy = ReceptionPolicy::defaults(Path::new("/inbox"));
        assert_eq!(policy.destination("Ada Lovelace"), Path::new("/inbox"));

        policy.append_sender_folder = true;
        assert_eq!(
            policy.destination("Ada Lovelace"),
            Path::new("/inbox/Ada Lovelace")
        );

        policy.append_date_folder = true;
        let dest = policy.destination("Ada Lovelace");
        let date = dest.file_name().unwrap().to_str().unwrap();
        assert_eq!(date.len(), 8);
        assert!(date.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_destination_skips_empty_sender() {
        let mut policy = ReceptionPolicy::defaults(Path::new("/inbox"));
        policy.append_sender_folder = true;
        assert_eq!(policy.destination(""), Path::new("/inbox"));
    }
}
