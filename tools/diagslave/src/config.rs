//! Configuration loading
//!
//! Priority (highest to lowest):
//! 1. Command-line flags
//! 2. Environment variables (`DIAGSLAVE_`, nested keys joined with `__`)
//! 3. Configuration file given with `--config`
//! 4. Default values

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml, Yaml},
    Figment,
};
use std::path::Path;

use crate::args::{Args, PortOrParity};
use voltage_slave::{ServerConfig, Transport};

const ENV_PREFIX: &str = "DIAGSLAVE_";

/// Build the effective server configuration
pub fn load(args: &Args) -> Result<ServerConfig> {
    let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
    if let Some(path) = &args.config {
        figment = figment.merge(file_provider(path)?);
    }
    figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

    let mut config: ServerConfig = figment
        .extract()
        .context("Failed to load configuration")?;
    apply_args(&mut config, args)?;
    Ok(config)
}

fn file_provider(path: &Path) -> Result<Figment> {
    if !path.exists() {
        bail!("Configuration file not found: {}", path.display());
    }
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .context("Config file must have an extension")?;

    let figment = match extension {
        "toml" => Figment::new().merge(Toml::file(path)),
        "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
        "json" => Figment::new().merge(Json::file(path)),
        other => bail!("Unsupported config file format: {}", other),
    };
    Ok(figment)
}

fn apply_args(config: &mut ServerConfig, args: &Args) -> Result<()> {
    if let Some(device) = &args.serial_port {
        config.serial.device = device.clone();
    }

    // A serial port without an explicit mode means RTU
    match args.protocol {
        Some(Transport::Tcp) if args.serial_port.is_some() => {
            bail!("Invalid number of parameters: a serial port cannot be used with -m tcp");
        },
        Some(protocol) => config.protocol = protocol,
        None if args.serial_port.is_some() && config.protocol == Transport::Tcp => {
            config.protocol = Transport::Rtu;
        },
        None => {},
    }

    if let Some(address) = args.address {
        config.address = Some(address);
    }
    if let Some(secs) = args.master_timeout {
        config.master_timeout_ms = secs_to_ms(secs);
    }
    if let Some(secs) = args.connection_timeout {
        config.connection_timeout_ms = secs_to_ms(secs);
    }
    match args.port {
        Some(PortOrParity::Port(port)) => config.tcp.port = port,
        Some(PortOrParity::Parity(parity)) => config.serial.parity = parity,
        None => {},
    }
    if let Some(baud) = args.baud_rate {
        config.serial.baud_rate = baud;
    }
    if let Some(bits) = args.data_bits {
        config.serial.data_bits = bits;
    }
    if let Some(bits) = args.stop_bits {
        config.serial.stop_bits = bits;
    }
    if let Some(delay) = args.rs485_delay {
        config.rs485_delay_ms = Some(delay);
    }
    Ok(())
}

/// Seconds from the command line, already checked finite and non-negative
fn secs_to_ms(secs: f64) -> u64 {
    // Float to int casts saturate
    (secs * 1000.0).round() as u64
}
