pub mod auth;
pub mod config;
pub mod events;
pub mod logging;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod server;
pub mod signal;
pub mod state;
pub mod storage;
