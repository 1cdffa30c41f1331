// Library interface for hedge-edge-bridge-core
// Exposes the messaging substrate and copier engine for embedding hosts

pub mod bridge;
pub mod channel_reader;
pub mod config;
pub mod control;
pub mod copier;
pub mod daily_limit;
pub mod host;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod pipe;
pub mod port_manager;
pub mod session_manager;
