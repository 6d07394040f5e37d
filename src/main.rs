//! # whsentry-proxy
//!
//! A forwarding HTTP proxy that sits in front of outbound webhook delivery,
//! containing SSRF exposure (CIDR deny-list on the resolved egress address),
//! upgrading plain connections to TLS on request, presenting client
//! certificates, and capping response body size and connection lifetime.
//!
//! ## Architecture
//!
//! - **Config**: TOML file, loaded once at startup into an immutable
//!   [`config::ProxyConfig`] shared by every connection.
//! - **App Layer**: [`app::proxy_app::ProxyApp`] classifies each inbound
//!   connection and drives either the Forward Engine or the Tunnel Engine.
//! - **Service Layer**: [`service::listener`] turns each configured
//!   listener into a bound Pingora service.
//! - **System Layer**: [`system::server`] bootstraps and runs the single
//!   Pingora server process hosting every listener.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use whsentry_proxy::{config, system};

/// Command-line arguments, per spec §6.
#[derive(Parser, Debug)]
#[command(name = "whsentry-proxy", about = "Egress-sandboxed forwarding proxy for outbound webhook delivery")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "whsentry-proxy.toml")]
    config: PathBuf,

    /// Validate the config file and exit without binding any listener.
    #[arg(long)]
    check: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    quiet: u8,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        let base = LevelFilter::Info as i8;
        let level = (base + self.verbose as i8 - self.quiet as i8).clamp(
            LevelFilter::Off as i8,
            LevelFilter::Trace as i8,
        );
        match level {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Main entry point.
///
/// 1. Parses CLI arguments and sets up logging.
/// 2. Loads and validates the config file; with `--check`, stops here.
/// 3. Installs a Ctrl-C handler that logs the shutdown and lets Pingora's
///    own signal handling (installed inside `Server::run`) take it from
///    there.
/// 4. Runs the server; this call blocks until shutdown.
fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    let config = match config::FileConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("failed to load config {}: {e}", cli.config.display());
            std::process::exit(1);
        }
    };

    if cli.check {
        log::info!("config {} is valid ({} listener(s))", cli.config.display(), config.listeners.len());
        return;
    }

    let config = Arc::new(config);

    ctrlc::set_handler(|| {
        log::info!("SIGINT received, shutting down");
    })
    .expect("error setting Ctrl-C handler");

    log::info!("starting whsentry-proxy with {} listener(s)", config.listeners.len());
    system::server::init(config);
}
