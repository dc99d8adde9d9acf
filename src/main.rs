use clap::Parser;

use confab::config::{Cli, Config};
use confab::server::{build_router, ServerState};
use confab::storage::{db_path, Storage};
use confab::{clog, logging};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    logging::init();

    clog!("confab starting");
    clog!("  data directory: {}", config.data_dir.display());

    let Some(token_secret) = config.token_secret else {
        clog!("error: no token secret configured (--token-secret or CONFAB_TOKEN_SECRET)");
        std::process::exit(1);
    };

    let path = db_path(&config.data_dir);
    let storage = match Storage::open(&path) {
        Ok(storage) => storage,
        Err(e) => {
            clog!("error: failed to open database {}: {e}", path.display());
            std::process::exit(1);
        }
    };
    clog!("  database: {}", path.display());

    let server = ServerState::new(storage, &token_secret);
    let router = build_router(server);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    clog!("  listening on {}", config.bind_addr);

    axum::serve(listener, router)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
