//! Diagnostic Modbus slave (`diagslave`)
//!
//! Serves zero-initialised in-memory data tables over Modbus RTU, ASCII or
//! TCP so that masters can be commissioned and tested without a real device.

mod args;
mod config;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use args::Args;
use voltage_slave::{LoopStatus, MemoryTable, ServerConfig, SlaveServer, Transport};

/// Pause after a non-fatal transport error before the next step
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = logging::init(&args.log_level, args.no_color) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(args: Args) -> Result<()> {
    let config = config::load(&args)?;
    config.validate().context("Invalid configuration")?;
    print_config(&config);

    let mut server = SlaveServer::new(config.clone());
    let identity = Arc::new(config.identity.clone());
    for address in config.served_addresses() {
        let table =
            MemoryTable::with_layout(address, config.layout).identity(Arc::clone(&identity));
        server.add_data_table(address, table);
    }

    server.startup().await.context("Server startup failed")?;
    info!("Server started, press Ctrl-C to stop");

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            },
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    loop {
        match server.server_loop().await {
            Ok(LoopStatus::Shutdown) => break,
            Ok(LoopStatus::Timeout) => info!("Master activity timeout"),
            Ok(status @ LoopStatus::Served { .. }) => debug!("{}", status),
            Ok(status) => info!("{}", status),
            Err(e) if e.is_fatal() => {
                server.shutdown().await;
                return Err(e).context("Server stopped");
            },
            Err(e) => {
                warn!("{}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
            },
        }
    }

    server.shutdown().await;
    let stats = server.stats();
    info!(
        "Stopped: {} requests, {} exceptions, {} frames dropped, {} connections",
        stats.requests, stats.exceptions, stats.frames_dropped, stats.connections_accepted
    );
    Ok(())
}

fn print_config(config: &ServerConfig) {
    info!("diagslave {}", env!("CARGO_PKG_VERSION"));
    match config.protocol {
        Transport::Tcp => info!(
            "Protocol: Modbus TCP on {}, connection timeout {}s",
            config.tcp.bind_addr(),
            config.connection_timeout().as_secs()
        ),
        protocol => info!(
            "Protocol: Modbus {} on {}, {} baud, {} data bits, {} stop bits, parity {}",
            protocol,
            config.serial.device,
            config.serial.baud_rate,
            config.serial.data_bits,
            config.serial.stop_bits,
            config.serial.parity
        ),
    }
    match config.address {
        Some(address) => info!("Slave address: {}", address),
        None => info!("Slave address: all"),
    }
    info!(
        "Master activity timeout: {}s",
        config.master_timeout().as_secs()
    );
    if let Some(delay) = config.rs485_delay_ms {
        info!("RS-485 mode, transmit enable hold {} ms", delay);
    }

    match serde_yaml::to_string(config) {
        Ok(yaml) => debug!("Effective configuration:\n{}", yaml),
        Err(e) => debug!("Cannot render configuration: {}", e),
    }
}
