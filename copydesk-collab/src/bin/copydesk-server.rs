//! Standalone collaboration server.
//!
//! Configuration comes from `COPYDESK_*` environment variables; logging
//! from `RUST_LOG` (default `info`).

use std::sync::Arc;

use copydesk_collab::{CollabConfig, CollabServer, CollabService};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CollabConfig::from_env();
    info!("Starting Copydesk collaboration server on {}...", config.bind_addr);

    let service = match CollabService::builder(config).build() {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to open storage: {e}");
            std::process::exit(1);
        }
    };

    let server = CollabServer::new(service);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
