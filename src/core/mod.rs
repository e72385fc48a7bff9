pub mod config;
pub mod discovery;
pub mod engine;
pub mod events;
pub mod icon;
pub mod icons;
pub mod identity;
pub mod network_entries;
pub mod peer_registry;
pub mod picker;
pub mod reception;
pub mod registry;
pub mod transfer;
