//! Relaymux CLI - identity and discovery tooling for relay clients

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaymux_discovery::{DiscoveryClient, HttpDiscovery};
use relaymux_proto::{Keypair, PublicKey};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("RELAYMUX_GIT_HASH"),
    " ",
    env!("RELAYMUX_BUILD_TIME"),
    ")"
);

/// Relaymux - inspect relay identities and the discovery service
#[derive(Parser, Debug)]
#[command(name = "relaymux")]
#[command(about = "Relaymux - inspect relay identities and the discovery service")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a new client keypair
    Keygen,

    /// Fetch a discovery entry and check its signature
    Entry {
        /// Discovery service URL (e.g., http://discovery.example.com:9090)
        #[arg(long, env = "RELAYMUX_DISCOVERY")]
        discovery: String,

        /// Public key of the entry owner (hex)
        public_key: PublicKey,

        /// Request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },

    /// List relay servers that accept new clients
    Servers {
        /// Discovery service URL
        #[arg(long, env = "RELAYMUX_DISCOVERY")]
        discovery: String,

        /// Request timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn discovery_client(url: &str, timeout: u64) -> Result<HttpDiscovery> {
    HttpDiscovery::with_timeout(url, Duration::from_secs(timeout))
        .with_context(|| format!("Invalid discovery URL: {}", url))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Keygen => {
            let keypair = Keypair::generate();
            println!("public_key: {}", keypair.public_key());
            println!("secret_key: {}", keypair.secret_hex());
        }
        Commands::Entry {
            discovery,
            public_key,
            timeout,
        } => {
            let client = discovery_client(&discovery, timeout)?;
            debug!("Fetching entry for {} from {}", public_key, client.base_url());

            let entry = client
                .entry(&public_key)
                .await
                .with_context(|| format!("Failed to fetch entry for {}", public_key))?;

            println!("{}", serde_json::to_string_pretty(&entry)?);
            match entry.verify() {
                Ok(()) => info!("Signature valid"),
                Err(e) => anyhow::bail!("Entry for {} failed verification: {}", public_key, e),
            }
        }
        Commands::Servers { discovery, timeout } => {
            let client = discovery_client(&discovery, timeout)?;
            let servers = client
                .available_servers()
                .await
                .context("Failed to list relay servers")?;

            if servers.is_empty() {
                info!("No relay servers available");
            }
            for entry in servers {
                let (address, slots) = entry
                    .server
                    .as_ref()
                    .map(|s| (s.address.as_str(), s.available_connections))
                    .unwrap_or(("-", 0));
                println!("{}  {}  {} slots", entry.static_pk, address, slots);
            }
        }
    }

    Ok(())
}
