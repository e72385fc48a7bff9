//! Avatar exchange: the serving side and the fetching client.

pub mod client;
pub mod server;
