//! Configuration types and constants for the confab server.

use std::path::PathBuf;

use clap::Parser;

/// Capacity of each per-user broadcast channel.
pub(crate) const CHANNEL_CAPACITY: usize = 256;

/// Maximum concurrent websocket connections accepted by the server.
pub(crate) const MAX_WS_CONNECTIONS: usize = 4096;

/// Presence and message-relay server for a friend-based chat application.
///
/// Authenticates websocket connections against the active-session table,
/// relays direct messages between friends, queues messages for offline
/// receivers in SQLite, and fans out presence and typing notifications.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence.
#[derive(Parser, Debug)]
#[command(name = "confab", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: CONFAB_BIND] [default: 127.0.0.1:4000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the database [env: CONFAB_HOME] [default: ~/.confab]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// HMAC secret for verifying connection tokens [env: CONFAB_TOKEN_SECRET]
    #[arg(long)]
    pub token_secret: Option<String>,
}

pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub token_secret: Option<String>,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| std::env::var("CONFAB_HOME").ok().map(PathBuf::from))
            .unwrap_or_else(|| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".confab"))
                    .unwrap_or_else(|_| PathBuf::from(".confab"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| std::env::var("CONFAB_BIND").ok())
            .unwrap_or_else(|| "127.0.0.1:4000".to_string());

        let token_secret = cli
            .token_secret
            .or_else(|| std::env::var("CONFAB_TOKEN_SECRET").ok());

        Self {
            bind_addr,
            data_dir,
            token_secret,
        }
    }
}
