//! Global configuration and data directories.
//!
//! The configuration directory holds persistent state (`me.json`,
//! `peers.json`, the icon cache and the instance lock); the data directory is
//! the default root for received files. Both default to well-known locations
//! and can be overridden from the command line. Must be initialized once at
//! startup via `init()`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONF_DIR: OnceLock<PathBuf> = OnceLock::new();
static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global directories.
///
/// `conf` defaults to `~/.shareyourfiles/`, `data` to the user download
/// directory (home as fallback). Panics if called more than once.
pub fn init(conf: Option<&Path>, data: Option<&Path>) {
    let conf_dir = match conf {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .expect("No home directory found")
            .join(".shareyourfiles"),
    };
    let data_dir = match data {
        Some(p) => p.to_path_buf(),
        None => dirs::download_dir()
            .or_else(dirs::home_dir)
            .expect("No home directory found"),
    };

    CONF_DIR
        .set(conf_dir)
        .expect("paths::init() called more than once");
    DATA_DIR
        .set(data_dir)
        .expect("paths::init() called more than once");
}

/// Returns the configuration directory path.
///
/// Panics if `init()` has not been called.
pub fn conf() -> &'static Path {
    CONF_DIR
        .get()
        .expect("conf dir not initialized — call paths::init() first")
}

/// Returns the data (download root) directory path.
///
/// Panics if `init()` has not been called.
pub fn data() -> &'static Path {
    DATA_DIR
        .get()
        .expect("data dir not initialized — call paths::init() first")
}
