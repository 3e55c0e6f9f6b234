//! Clap CLI definitions for tulip.

use clap::Parser;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mCommands inside a session:\x1b[0m
  /lt, /list                    List secure talks
  / <name>                      Make <name> the current talk
  /connect <addr>.onion         Dial a peer (or /connect <alias>)
  /addab <alias> <value> [kind] Add an address book entry (kind: fp, onion)
  /ab                           Show the address book
  /whoami                       Show our fingerprint and onion address
  /quit                         Leave

Anything else is sent to the current talk.";

/// tulip: encrypted chat over onion services.
#[derive(Parser, Debug, Default)]
#[command(name = "tulip", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level instead of ~/.tulip/tulip.log.
    #[arg(long)]
    pub debug: bool,

    /// Tor control address, `tcp://host:port` or `unix:/path`.
    #[arg(long)]
    pub control_addr: Option<String>,

    /// Tor control port password.
    #[arg(long)]
    pub control_passwd: Option<String>,

    /// Tor SOCKS5 proxy for outbound talks.
    #[arg(long)]
    pub socks_addr: Option<String>,

    /// Do not publish an onion service; listen on the local endpoint only.
    #[arg(long)]
    pub no_onion: bool,
}
