//! parapet command line.
//!
//! Runs a TLS-terminating HTTP/1.1 server that answers every request with a
//! fixed `200 OK` and a `Hello` body.
//!
//! # Quick Start
//!
//! ```bash
//! # Serve on 0.0.0.0:8081 with the aws-lc-rs TLS engine
//! parapet aws-lc-rs
//!
//! # Query it (the certificate is self-signed)
//! curl -k https://localhost:8081/
//! ```

mod serve;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parapet_config::{ConfigLoader, ParapetConfig};
use parapet_server::{Balance, TlsEngine};

/// parapet - a minimal TLS-terminating HTTP/1.1 server.
#[derive(Parser, Debug)]
#[command(name = "parapet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TLS engine (aws-lc-rs, ring).
    #[arg(value_parser = parse_engine)]
    engine: TlsEngine,

    /// IP address to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen backlog handed to the OS.
    #[arg(long)]
    backlog: Option<u32>,

    /// Number of I/O worker threads.
    #[arg(long)]
    io_workers: Option<usize>,

    /// Number of TLS handshake offload threads.
    #[arg(long)]
    handshake_workers: Option<usize>,

    /// How connections are spread over workers (round-robin, least-loaded).
    #[arg(long, value_parser = parse_balance)]
    balance: Option<Balance>,

    /// Largest request body accepted, in bytes.
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Seconds a graceful shutdown may take before connections are aborted.
    #[arg(long)]
    shutdown_timeout_secs: Option<u64>,

    /// Directory holding parapet.toml and parapet.local.toml.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    /// Flags win over files and environment.
    fn apply(&self, config: &mut ParapetConfig) {
        config.tls.engine = Some(self.engine);
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(backlog) = self.backlog {
            config.server.backlog = backlog;
        }
        if let Some(secs) = self.shutdown_timeout_secs {
            config.server.shutdown_timeout_secs = secs;
        }
        if let Some(size) = self.max_message_size {
            config.limits.max_message_size = size;
        }
        if let Some(count) = self.io_workers {
            config.workers.io_workers = Some(count);
        }
        if let Some(count) = self.handshake_workers {
            config.workers.handshake_workers = Some(count);
        }
        if let Some(balance) = self.balance {
            config.workers.balance = balance;
        }
    }
}

fn parse_engine(value: &str) -> Result<TlsEngine, String> {
    value.parse().map_err(|e: parapet_server::ServerError| e.to_string())
}

fn parse_balance(value: &str) -> Result<Balance, String> {
    value.parse().map_err(|e: parapet_server::ServerError| e.to_string())
}

fn main() -> Result<()> {
    // Logs go to stderr so --print-config output stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(dir) = &cli.config_dir {
        loader = loader.with_project_dir(dir);
    }
    let mut config = loader.load().context("Failed to load configuration")?;
    cli.apply(&mut config);

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    serve::run(&config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_loaded_config() {
        let cli = Cli::parse_from([
            "parapet",
            "ring",
            "--port",
            "9443",
            "--io-workers",
            "2",
            "--balance",
            "least-loaded",
        ]);
        let mut config = ParapetConfig::default();
        config.server.port = 1;
        cli.apply(&mut config);

        assert_eq!(config.tls.engine, Some(TlsEngine::Ring));
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.workers.io_workers, Some(2));
        assert_eq!(config.workers.balance, Balance::LeastLoaded);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn engine_is_required() {
        assert!(Cli::try_parse_from(["parapet"]).is_err());
        assert!(Cli::try_parse_from(["parapet", "openssl"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
