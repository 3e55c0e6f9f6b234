//! Operator command parsing.
//!
//! Lines starting with `/` are commands; everything else is chat for the
//! current talk. Parsing is pure; the session decides what each command does.

use thiserror::Error;
use tulip_types::{AttestationKind, OnionAddress, TulipError};
use tulip_types::attestation::ONION_SUFFIX;

/// Operator mistakes. Always shown as warnings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("No such command: /{0}")]
    Unknown(String),
    #[error("It's not an onion address: {0}")]
    NotOnion(String),
    #[error("{0}")]
    BadEntry(String),
    #[error("There is no active talk.")]
    NoActiveTalk,
    #[error("No such talk: {0}")]
    NoSuchTalk(String),
}

impl From<TulipError> for CommandError {
    fn from(e: TulipError) -> Self {
        Self::BadEntry(e.to_string())
    }
}

/// Where `/connect` should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Address(OnionAddress),
    /// An alias to resolve to its onion address.
    Alias(String),
}

/// A parsed operator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListTalks,
    Select(String),
    AddEntry {
        alias: String,
        value: String,
        kind: AttestationKind,
    },
    Connect(Target),
    ListBook,
    WhoAmI,
    Help,
    Quit,
    Chat(String),
}

const ADDAB_USAGE: &str = "/addab <alias> <value> [kind]";
const CONNECT_USAGE: &str = "/connect <address>.onion";
const SELECT_USAGE: &str = "/ <name>";

/// Parse one operator line.
pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Chat(line.to_string()));
    };

    // "/ name" selects; the verb is empty.
    let (verb, args) = match rest.split_once(' ') {
        Some((verb, args)) => (verb, args.split_whitespace().collect::<Vec<_>>()),
        None => (rest, Vec::new()),
    };

    match verb {
        "" => match args.as_slice() {
            [name] => Ok(Command::Select(name.to_string())),
            _ => Err(CommandError::Usage(SELECT_USAGE)),
        },
        "lt" | "list" => Ok(Command::ListTalks),
        "ab" => Ok(Command::ListBook),
        "whoami" => Ok(Command::WhoAmI),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "addab" => match args.as_slice() {
            [alias, value] => Ok(Command::AddEntry {
                alias: alias.to_string(),
                value: value.to_string(),
                kind: AttestationKind::Fingerprint,
            }),
            [alias, value, kind] => Ok(Command::AddEntry {
                alias: alias.to_string(),
                value: value.to_string(),
                kind: AttestationKind::parse(kind)?,
            }),
            _ => Err(CommandError::Usage(ADDAB_USAGE)),
        },
        "connect" => match args.as_slice() {
            [target] if target.to_ascii_lowercase().ends_with(ONION_SUFFIX) => {
                let address = OnionAddress::parse(target)
                    .map_err(|_| CommandError::NotOnion(target.to_string()))?;
                Ok(Command::Connect(Target::Address(address)))
            }
            [target] if !target.contains('.') => {
                Ok(Command::Connect(Target::Alias(target.to_string())))
            }
            [target] => Err(CommandError::NotOnion(target.to_string())),
            _ => Err(CommandError::Usage(CONNECT_USAGE)),
        },
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

/// Help text for `/help`.
pub const HELP: &[(&str, &str)] = &[
    ("/lt, /list", "list secure talks"),
    ("/ <name>", "make <name> the current talk"),
    ("/connect <addr>.onion", "dial a peer, or /connect <alias>"),
    ("/addab <alias> <value> [kind]", "add an address book entry"),
    ("/ab", "show the address book"),
    ("/whoami", "show our identity"),
    ("/help", "show this list"),
    ("/quit, /exit", "leave"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_lines() {
        assert_eq!(
            parse_command("hello there").unwrap(),
            Command::Chat("hello there".into())
        );
        assert_eq!(parse_command("").unwrap(), Command::Chat(String::new()));
    }

    #[test]
    fn test_list_and_select() {
        assert_eq!(parse_command("/lt").unwrap(), Command::ListTalks);
        assert_eq!(parse_command("/list").unwrap(), Command::ListTalks);
        assert_eq!(
            parse_command("/ browser").unwrap(),
            Command::Select("browser".into())
        );
        assert_eq!(
            parse_command("/").unwrap_err(),
            CommandError::Usage(SELECT_USAGE)
        );
    }

    #[test]
    fn test_addab() {
        assert_eq!(
            parse_command("/addab alice 2264d806e7789a5773bdaffb798bcf3fdb456a81 otr-fp").unwrap(),
            Command::AddEntry {
                alias: "alice".into(),
                value: "2264d806e7789a5773bdaffb798bcf3fdb456a81".into(),
                kind: AttestationKind::Fingerprint,
            }
        );
        assert_eq!(
            parse_command("/addab bob bobsplace.onion onion").unwrap(),
            Command::AddEntry {
                alias: "bob".into(),
                value: "bobsplace.onion".into(),
                kind: AttestationKind::OnionAddress,
            }
        );
        assert!(matches!(
            parse_command("/addab alice 00ff").unwrap(),
            Command::AddEntry { kind: AttestationKind::Fingerprint, .. }
        ));
        assert_eq!(
            parse_command("/addab alice").unwrap_err(),
            CommandError::Usage(ADDAB_USAGE)
        );
        assert!(matches!(
            parse_command("/addab alice 00ff pgp").unwrap_err(),
            CommandError::BadEntry(_)
        ));
    }

    #[test]
    fn test_connect() {
        assert_eq!(
            parse_command("/connect peerpeerpeer.onion").unwrap(),
            Command::Connect(Target::Address(
                OnionAddress::parse("peerpeerpeer.onion").unwrap()
            ))
        );
        assert_eq!(
            parse_command("/connect bob").unwrap(),
            Command::Connect(Target::Alias("bob".into()))
        );
        assert_eq!(
            parse_command("/connect example.com").unwrap_err(),
            CommandError::NotOnion("example.com".into())
        );
        assert_eq!(
            parse_command("/connect bad!name.onion").unwrap_err(),
            CommandError::NotOnion("bad!name.onion".into())
        );
        assert_eq!(
            parse_command("/connect").unwrap_err(),
            CommandError::Usage(CONNECT_USAGE)
        );
    }

    #[test]
    fn test_help_lists_every_command() {
        let usages: Vec<&str> = HELP
            .iter()
            .flat_map(|(usage, _)| usage.split(", "))
            .filter_map(|usage| usage.split_whitespace().next())
            .collect();
        for verb in [
            "/lt", "/list", "/", "/connect", "/addab", "/ab", "/whoami", "/help", "/quit", "/exit",
        ] {
            assert!(usages.contains(&verb), "{verb} missing from help");
        }
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            parse_command("/frobnicate now").unwrap_err(),
            CommandError::Unknown("frobnicate".into())
        );
    }
}
