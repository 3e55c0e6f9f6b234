//! Configuration types, deserialized from `~/.tulip/config.toml`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default bounded-queue capacity for every per-talk queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default keepalive ping period (seconds).
pub const DEFAULT_KEEPALIVE_SECS: u64 = 2;

/// Default maximum ciphertext fragment size (bytes).
pub const DEFAULT_FRAGMENT_SIZE: usize = 140;

/// A contact preloaded into the address book at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactEntry {
    /// Alias shown for the contact.
    pub alias: String,
    /// Attestation value, e.g. a hex fingerprint.
    pub value: String,
    /// Attestation kind tag (`fp`, `otr-fp`, `onion`).
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "fp".to_string()
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TulipConfig {
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Local address the talk endpoint listens on. Port 0 picks a free port.
    pub listen_addr: String,
    /// HTTP path of the WebSocket talk endpoint.
    pub talk_path: String,
    /// Tor control port, `tcp://host:port`.
    pub control_addr: String,
    /// Tor control port password. Empty means cookie or no authentication.
    pub control_password: String,
    /// Tor SOCKS5 proxy used for outbound talks.
    pub socks_addr: String,
    /// Virtual port of the onion service.
    pub onion_port: u16,
    /// Capacity of each per-talk bounded queue.
    pub queue_capacity: usize,
    /// Keepalive ping period in seconds.
    pub keepalive_secs: u64,
    /// Maximum ciphertext fragment size in bytes.
    pub fragment_size: usize,
    /// Address book entries loaded at start.
    pub contacts: Vec<ContactEntry>,
}

impl Default for TulipConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            talk_path: "/tulip".to_string(),
            control_addr: "tcp://127.0.0.1:9051".to_string(),
            control_password: String::new(),
            socks_addr: "127.0.0.1:9050".to_string(),
            onion_port: 80,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            contacts: Vec::new(),
        }
    }
}

impl TulipConfig {
    /// `~/.tulip`, or `./.tulip` when no home directory is known.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".tulip"))
            .unwrap_or_else(|| PathBuf::from(".tulip"))
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }
}
