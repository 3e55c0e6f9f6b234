//! Configuration loading.

use crate::cli::Cli;
use std::path::Path;
use tracing::{debug, warn};
use tulip_types::TulipConfig;

/// Load configuration from a TOML file, falling back to defaults when the
/// file is missing or unreadable.
pub fn load_config(path: &Path) -> TulipConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<TulipConfig>(&contents) {
            Ok(config) => {
                debug!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid config, using defaults");
                TulipConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No config file, using defaults");
            TulipConfig::default()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to read config, using defaults");
            TulipConfig::default()
        }
    }
}

/// Apply command-line overrides.
pub fn apply_overrides(config: &mut TulipConfig, cli: &Cli) {
    if let Some(addr) = &cli.control_addr {
        config.control_addr = addr.clone();
    }
    if let Some(password) = &cli.control_passwd {
        config.control_password = password.clone();
    }
    if let Some(addr) = &cli.socks_addr {
        config.socks_addr = addr.clone();
    }
    if cli.debug {
        config.log_level = "debug".to_string();
    }
}
