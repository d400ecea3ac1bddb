//! Clanwatch - watches clans, players and wars of the Clash of Clans API and
//! logs every change.
//!
//! # Configuration
//!
//! Create a `config.yaml` file, see [`clanwatch::config`] for every setting:
//!
//! ```yaml
//! rest:
//!   keys: ["your-api-key"]
//! polling:
//!   clans: ["#2PP"]
//!   wars: ["#2PP"]
//! ```
//!
//! # Environment Variable Overrides
//!
//! Override any configuration value using environment variables with the `CLANWATCH_` prefix:
//!
//! ```bash
//! export CLANWATCH_ACCOUNT__EMAIL="me@example.com"
//! export CLANWATCH_ACCOUNT__PASSWORD="your-password"
//! ```
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=debug clanwatch --config config.yaml
//! ```

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use clanwatch::{config::Config, watcher::Watcher};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: String,
}

#[tokio::main]
async fn main() {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    info!("Starting clanwatch {}...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load config file: {}", e);
            return;
        }
    };

    let watcher = match Watcher::new(config).await {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to initialize watcher: {:#}", e);
            return;
        }
    };

    if let Err(e) = watcher.run().await {
        error!("Watcher stopped: {:#}", e);
    }
}
