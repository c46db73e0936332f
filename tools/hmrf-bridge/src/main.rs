// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hmrf-bridge - UART-to-UDP bridge for Homematic radio modules
//!
//! Opens the module UART, identifies the attached module, then exposes the
//! raw frame stream to one UDP client until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: /dev/ttyS1, UDP port 3008
//! hmrf-bridge
//!
//! # Configuration file with overrides
//! hmrf-bridge --config bridge.toml --port 3010 --log-level debug
//!
//! # Generate / validate a configuration file
//! hmrf-bridge gen-config --output bridge.toml
//! hmrf-bridge validate --config bridge.toml
//! ```

use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hmrf_link::{
    BridgeConfig, ModuleLink, NoResetLine, ResetLine, RgbLed, SerialUart, SysfsResetLine,
    TunnelSession,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hmrf-bridge")]
#[command(about = "Homematic radio module UART-to-UDP bridge")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Module serial device
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// UDP port of the tunnel
    #[arg(short, long)]
    port: Option<u16>,

    /// GPIO value file driving the module reset line
    #[arg(long)]
    reset_gpio: Option<PathBuf>,

    /// Skip module detection at startup
    #[arg(long)]
    no_detect: bool,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "hmrf-bridge.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    tracing::info!(
        version = hmrf_link::VERSION,
        device = %config.uart.device.display(),
        port = config.tunnel.port,
        "Starting hmrf-bridge"
    );

    run(config)
}

/// Load the configuration file (or defaults) and apply CLI overrides.
fn build_config(args: &Args) -> Result<BridgeConfig> {
    let mut config = match args.config {
        Some(ref path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(ref device) = args.device {
        config.uart.device = device.clone();
    }
    if let Some(port) = args.port {
        config.tunnel.port = port;
    }
    if let Some(ref gpio) = args.reset_gpio {
        config.reset.gpio_value_path = Some(gpio.clone());
    }
    if args.no_detect {
        config.detection.enabled = false;
    }
    if let Some(ref level) = args.log_level {
        config.log_level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn run(config: BridgeConfig) -> Result<()> {
    let reset: Box<dyn ResetLine> = match config.reset.gpio_value_path {
        Some(ref path) => Box::new(SysfsResetLine::new(path)),
        None => Box::new(NoResetLine),
    };
    let leds = RgbLed::logging().context("Failed to register status LEDs")?;

    let link = Arc::new(ModuleLink::new(
        &config,
        Box::new(SerialUart::new(&config.uart.device)),
        reset,
        leds,
    ));
    link.start().context("Failed to start module link")?;

    let identity = link.identity();
    if identity.is_detected() {
        tracing::info!(
            module = %identity.module_type,
            status = %serde_json::to_string(&identity.status())?,
            "Radio module detected"
        );
    } else {
        tracing::warn!("No radio module detected");
    }

    let tunnel = TunnelSession::new(link.clone(), &config.tunnel);
    tunnel.start().context("Failed to start UDP tunnel")?;
    if let Some(addr) = tunnel.local_addr() {
        tracing::info!(%addr, "Tunnel listening");
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, shutting down...");
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl+C handler")?;

    let _ = stop_rx.recv();

    tunnel.stop();
    link.stop();
    tracing::info!("Bridge shutdown complete");
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> Result<()> {
    let mut config = BridgeConfig::default();
    config.reset.gpio_value_path = Some(PathBuf::from("/sys/class/gpio/gpio18/value"));

    let content = format!(
        "# hmrf-bridge configuration\n\
         # Generated by hmrf-bridge v{}\n\n{}",
        hmrf_link::VERSION,
        toml::to_string_pretty(&config)?
    );

    std::fs::write(&output, content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration written to {}", output.display());
    Ok(())
}

fn cmd_validate(path: PathBuf) -> Result<()> {
    match BridgeConfig::from_file(&path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!("  Device: {}", config.uart.device.display());
            println!(
                "  Tunnel: {}:{}",
                config.tunnel.bind_address, config.tunnel.port
            );
            println!(
                "  Detection: {}",
                if config.detection.enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    }
}
