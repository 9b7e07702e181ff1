//! Coordinator, participant clients and the HTTP transport.

pub mod coordinator;
pub mod dist_config;
pub mod messages;
pub mod network;

#[cfg(feature = "distributed")]
pub mod http_server;
