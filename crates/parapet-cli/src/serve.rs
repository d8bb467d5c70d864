//! Serve command - runs the parapet server until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use parapet_config::ParapetConfig;
use parapet_server::{HelloHandler, Server};
use tracing::{info, warn};

pub fn run(config: &ParapetConfig) -> Result<()> {
    let server_config = config
        .to_server_config()
        .context("Invalid server configuration")?;

    info!(engine = %server_config.tls_engine, "Using TLS engine {}", server_config.tls_engine);

    let mut server = Server::with_signal_handling(server_config, HelloHandler)
        .context("Failed to create server")?;
    let addr = server.bind().context("Failed to bind listening socket")?;

    println!();
    println!("parapet - TLS-terminating HTTP/1.1 server");
    println!();
    println!("  Listening on:   https://{addr}");
    println!("  TLS engine:     {}", server.config().tls_engine);
    println!("  I/O workers:    {}", server.config().io_workers);
    println!();
    println!("Server is ready. Press Ctrl+C to stop.");
    println!();

    let report = server.run().context("Server error during operation")?;

    if report.graceful {
        println!("Server stopped gracefully.");
    } else {
        warn!(
            aborted = report.workers_aborted,
            "shutdown timeout elapsed, remaining connections were aborted"
        );
        println!("Server stopped after aborting remaining connections.");
    }

    Ok(())
}
