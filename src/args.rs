//! Command-line argument parsing and configuration.
//!
//! Supports CLI arguments via clap and an optional TOML configuration file;
//! CLI values take precedence over those from the file.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Share Your Files - LAN peer-to-peer file sharing daemon.
#[derive(Parser, Deserialize, Clone, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Directory for persistent state (identity, peers, icon cache, lock).
    /// Defaults to ~/.shareyourfiles/
    #[clap(long)]
    pub conf: Option<PathBuf>,

    /// Default destination directory for received files.
    #[clap(long)]
    pub data: Option<PathBuf>,

    /// First name advertised to peers (at most 16 characters).
    #[clap(long)]
    pub first_name: Option<String>,

    /// Last name advertised to peers (at most 16 characters).
    #[clap(long)]
    pub last_name: Option<String>,

    /// Start without advertising on the LAN.
    #[clap(long)]
    #[serde(default)]
    pub offline: bool,

    /// Accept every sharing request into the data directory without asking.
    #[clap(long)]
    #[serde(default)]
    pub auto_accept: bool,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    #[serde(default)]
    pub verbose: u8,
}

impl Args {
    /// Load Args from CLI plus `config.toml` (if it exists); CLI wins.
    pub fn load() -> Self {
        let mut cli_args = Args::parse();

        cli_args.conf = cli_args.conf.map(Self::resolve_path);
        cli_args.data = cli_args.data.map(Self::resolve_path);

        let default_path = PathBuf::from("config.toml");
        if let Some(file_args) = Self::from_file(&default_path) {
            return Self::merge(file_args, cli_args);
        }
        cli_args
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = fs::read_to_string(path).ok()?;
        toml::from_str::<Args>(&content).ok()
    }

    /// Merge file args with CLI args (CLI takes precedence).
    fn merge(mut file: Args, cli: Args) -> Args {
        if cli.conf.is_some() {
            file.conf = cli.conf;
        }
        if cli.data.is_some() {
            file.data = cli.data;
        }
        if cli.first_name.is_some() {
            file.first_name = cli.first_name;
        }
        if cli.last_name.is_some() {
            file.last_name = cli.last_name;
        }
        if cli.offline {
            file.offline = true;
        }
        if cli.auto_accept {
            file.auto_accept = true;
        }
        if cli.verbose > 0 {
            file.verbose = cli.verbose;
        }
        file
    }
}
