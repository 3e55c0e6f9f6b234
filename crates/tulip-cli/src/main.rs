//! tulip: interactive encrypted chat over tor onion services.
//!
//! Startup derives the channel identity from a passphrase, opens the local
//! talk endpoint, publishes it as an onion service through the tor control
//! port, and then hands the terminal to the command loop.

mod cli;
mod command;
mod config;
mod session;
mod ui;

use crate::cli::Cli;
use crate::session::Session;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tulip_types::TulipConfig;
use tulip_wire::keys::{derive_seed, ONION_INFO};
use tulip_wire::{
    AddressBook, LocalIdentity, OnionProvisioner, SealedChannelFactory, SessionNode,
    SocksDialer, TalkConfig, TorControl,
};
use zeroize::Zeroizing;

fn env_filter(level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
}

fn init_tracing_stderr(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .init();
}

/// Send tracing to a log file so it doesn't interleave with the chat.
fn init_tracing_file(level: &str) {
    let log_dir = TulipConfig::home_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("tulip.log");

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(level))
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(tracing::Level::ERROR)
                .with_writer(std::io::sink)
                .init();
        }
    }
}

fn read_passphrase(prompt: &str) -> Zeroizing<String> {
    match rpassword::prompt_password(prompt) {
        Ok(passphrase) => Zeroizing::new(passphrase),
        Err(e) => ui::critical(&format!("Unable to read passphrase: {e}")),
    }
}

fn main() {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(TulipConfig::default_path);
    let mut config = config::load_config(&config_path);
    config::apply_overrides(&mut config, &cli);

    if cli.debug {
        init_tracing_stderr(&config.log_level);
    } else {
        init_tracing_file(&config.log_level);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => ui::critical(&format!("Unable to start runtime: {e}")),
    };
    runtime.block_on(run(cli, config));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_timeout(Duration::from_millis(500));
}

async fn run(cli: Cli, config: TulipConfig) {
    // Identity first: nothing is meaningful without it.
    let passphrase = read_passphrase("Enter your passphrase for channel identity: ");
    let identity = match tokio::task::spawn_blocking(move || {
        LocalIdentity::from_passphrase(passphrase.as_bytes())
    })
    .await
    {
        Ok(Ok(identity)) => Arc::new(identity),
        Ok(Err(e)) => ui::critical(&format!("Unable to derive identity: {e}")),
        Err(e) => ui::critical(&format!("Identity derivation panicked: {e}")),
    };
    ui::info(&format!("Your fingerprint is {}", identity.fingerprint()));

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => ui::critical(&format!("Unable to listen on {}: {e}", config.listen_addr)),
    };
    let local_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => ui::critical(&format!("Unable to read listening address: {e}")),
    };
    info!(port = local_port, "Talk endpoint bound");

    // The control connection must outlive the session or tor drops the onion.
    let mut control = None;
    let onion = if cli.no_onion {
        ui::warn(&format!(
            "Onion service disabled; listening on 127.0.0.1:{local_port} only."
        ));
        None
    } else {
        let mut tor = match TorControl::connect(&config.control_addr).await {
            Ok(tor) => tor.with_onion_port(config.onion_port),
            Err(e) => ui::critical(&format!("Failed to connect to control socket: {e}")),
        };
        if let Err(e) = tor.authenticate(&config.control_password).await {
            ui::critical(&format!("Authentication failed: {e}"));
        }
        match tor.version().await {
            Ok(version) => ui::info(&format!("Tor version {version}")),
            Err(e) => warn!(error = %e, "Unable to query tor version"),
        }

        let passphrase = read_passphrase("Enter your passphrase for onion identity: ");
        let seed = match tokio::task::spawn_blocking(move || {
            derive_seed(passphrase.as_bytes(), ONION_INFO)
        })
        .await
        {
            Ok(Ok(seed)) => seed,
            Ok(Err(e)) => ui::critical(&format!("Unable to generate onion key: {e}")),
            Err(e) => ui::critical(&format!("Onion key derivation panicked: {e}")),
        };
        let address = match tor.provision(local_port, &seed).await {
            Ok(address) => address,
            Err(e) => ui::critical(&format!("Unable to publish onion service: {e}")),
        };
        ui::info(&format!("You're at {address}"));
        control = Some(tor);
        Some(address)
    };

    let factory = Arc::new(SealedChannelFactory::new(
        Arc::clone(&identity),
        config.fragment_size,
    ));
    let (node, new_talks, events) =
        SessionNode::new(factory, TalkConfig::from(&config), config.talk_path.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(node.clone().serve(listener, shutdown_rx));

    let (line_tx, line_rx) = mpsc::channel(config.queue_capacity.max(1));
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Unable to read from terminal");
                    break;
                }
            }
        }
    });

    let book = AddressBook::from_contacts(&config.contacts);
    let dialer = Arc::new(SocksDialer::new(config.socks_addr.clone(), config.onion_port));
    let session = Session::new(node, dialer, book, identity.fingerprint(), onion);
    session.run(line_rx, new_talks, events).await;

    shutdown_tx.send_replace(true);
    match tokio::time::timeout(Duration::from_secs(2), server).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Talk endpoint stopped with error"),
        Ok(Err(e)) => warn!(error = %e, "Talk endpoint task failed"),
        Ok(Ok(Ok(()))) => {}
        Err(_) => warn!("Talk endpoint did not stop in time"),
    }
    drop(control);
    info!("Bye");
}
