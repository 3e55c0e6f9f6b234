//! Onion service provisioning over the tor control port.
//!
//! Speaks just enough of the control protocol to authenticate, report the tor
//! version and register an `ED25519-V3` onion service whose key is derived
//! from the operator's passphrase. The service lives as long as the control
//! connection, so the caller keeps [`TorControl`] alive for the whole run.

use crate::error::WireError;
use crate::keys::expand_onion_key;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};
use tulip_types::OnionAddress;

/// Registers an onion service pointing at a local port.
#[async_trait]
pub trait OnionProvisioner: Send {
    async fn provision(&mut self, local_port: u16, seed: &[u8; 32])
        -> Result<OnionAddress, WireError>;
}

/// Where the control port lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAddr {
    Tcp(String),
    Unix(String),
}

impl ControlAddr {
    /// Parse `tcp://host:port`, `unix:/path` or a bare `host:port`.
    pub fn parse(value: &str) -> Result<Self, WireError> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("unix:") {
            let path = path.trim_start_matches("//");
            if path.is_empty() {
                return Err(WireError::Control(format!("bad control address: {value}")));
            }
            return Ok(Self::Unix(path.to_string()));
        }
        let addr = value.strip_prefix("tcp://").unwrap_or(value);
        if addr.is_empty() || !addr.contains(':') {
            return Err(WireError::Control(format!("bad control address: {value}")));
        }
        Ok(Self::Tcp(addr.to_string()))
    }
}

/// One control-port reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    /// Reply text of every line, data blocks folded into their keyword line.
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    /// Value of the first `key=value` line for `key`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }

    fn message(&self) -> String {
        format!("{} {}", self.status, self.lines.join(" / "))
    }
}

/// Split a reply line into status, separator and text.
fn parse_reply_line(line: &str) -> Result<(u16, char, &str), WireError> {
    let bad = || WireError::Control(format!("malformed reply line: {line:?}"));
    if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
        return Err(bad());
    }
    let status = line[..3].parse::<u16>().map_err(|_| bad())?;
    let separator = line[3..4].chars().next().ok_or_else(bad)?;
    if !matches!(separator, ' ' | '-' | '+') {
        return Err(bad());
    }
    Ok((status, separator, &line[4..]))
}

/// Authentication methods and cookie path from a `PROTOCOLINFO` reply.
fn parse_auth_methods(reply: &Reply) -> (Vec<String>, Option<String>) {
    let Some(auth) = reply.lines.iter().find_map(|l| l.strip_prefix("AUTH ")) else {
        return (Vec::new(), None);
    };
    let mut methods = Vec::new();
    let mut cookie = None;
    for field in auth.split(' ') {
        if let Some(list) = field.strip_prefix("METHODS=") {
            methods = list.split(',').map(str::to_string).collect();
        }
    }
    if let Some(start) = auth.find("COOKIEFILE=\"") {
        let rest = &auth[start + "COOKIEFILE=\"".len()..];
        if let Some(end) = rest.find('"') {
            cookie = Some(rest[..end].replace("\\\\", "\\"));
        }
    }
    (methods, cookie)
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ControlStream for T {}

/// A tor control-port connection.
pub struct TorControl {
    stream: BufReader<Box<dyn ControlStream>>,
    onion_port: u16,
}

impl TorControl {
    /// Connect to the control port at `addr`.
    pub async fn connect(addr: &str) -> Result<Self, WireError> {
        let stream: Box<dyn ControlStream> = match ControlAddr::parse(addr)? {
            ControlAddr::Tcp(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
            #[cfg(unix)]
            ControlAddr::Unix(path) => Box::new(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            ControlAddr::Unix(path) => {
                return Err(WireError::Control(format!(
                    "unix control sockets are not supported here: {path}"
                )))
            }
        };
        debug!(addr, "Connected to tor control port");
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn ControlStream> = Box::new(stream);
        Self {
            stream: BufReader::new(boxed),
            onion_port: 80,
        }
    }

    /// Virtual port the onion service listens on.
    pub fn with_onion_port(mut self, port: u16) -> Self {
        self.onion_port = port;
        self
    }

    /// Send one command and read its reply.
    pub async fn command(&mut self, command: &str) -> Result<Reply, WireError> {
        let verb = command.split(' ').next().unwrap_or_default();
        debug!(verb, "Control command");
        self.stream
            .get_mut()
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.stream.get_mut().flush().await?;
        self.read_reply().await
    }

    async fn read_line(&mut self) -> Result<String, WireError> {
        let mut line = String::new();
        if self.stream.read_line(&mut line).await? == 0 {
            return Err(WireError::ConnectionClosed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_reply(&mut self) -> Result<Reply, WireError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            let (status, separator, text) = parse_reply_line(&line)?;
            let mut text = text.to_string();
            if separator == '+' {
                loop {
                    let data = self.read_line().await?;
                    if data == "." {
                        break;
                    }
                    text.push('\n');
                    text.push_str(data.strip_prefix('.').unwrap_or(&data));
                }
            }
            lines.push(text);
            if separator == ' ' {
                return Ok(Reply { status, lines });
            }
        }
    }

    /// Authenticate with `password`, or with whatever tor offers when the
    /// password is empty (no auth or cookie).
    pub async fn authenticate(&mut self, password: &str) -> Result<(), WireError> {
        let command = if !password.is_empty() {
            format!("AUTHENTICATE {}", quote(password))
        } else {
            let info = self.command("PROTOCOLINFO 1").await?;
            if !info.is_ok() {
                return Err(WireError::ControlAuth(info.message()));
            }
            let (methods, cookie) = parse_auth_methods(&info);
            if methods.iter().any(|m| m == "NULL") {
                "AUTHENTICATE".to_string()
            } else if let (true, Some(path)) = (methods.iter().any(|m| m == "COOKIE"), cookie) {
                let cookie = tokio::fs::read(&path).await.map_err(|e| {
                    WireError::ControlAuth(format!("unable to read cookie {path}: {e}"))
                })?;
                format!("AUTHENTICATE {}", hex::encode(cookie))
            } else {
                return Err(WireError::ControlAuth(format!(
                    "no usable method among {}",
                    methods.join(",")
                )));
            }
        };

        let reply = self.command(&command).await?;
        if !reply.is_ok() {
            return Err(WireError::ControlAuth(reply.message()));
        }
        info!("Authenticated to tor control port");
        Ok(())
    }

    /// The running tor's version string.
    pub async fn version(&mut self) -> Result<String, WireError> {
        let reply = self.command("GETINFO version").await?;
        if !reply.is_ok() {
            return Err(WireError::Control(reply.message()));
        }
        reply
            .value("version")
            .map(str::to_string)
            .ok_or_else(|| WireError::Control("version missing from reply".into()))
    }
}

#[async_trait]
impl OnionProvisioner for TorControl {
    async fn provision(
        &mut self,
        local_port: u16,
        seed: &[u8; 32],
    ) -> Result<OnionAddress, WireError> {
        let key = expand_onion_key(seed);
        let command = format!(
            "ADD_ONION ED25519-V3:{} Port={},127.0.0.1:{local_port}",
            STANDARD.encode(&key[..]),
            self.onion_port
        );
        let reply = self.command(&command).await?;
        if !reply.is_ok() {
            return Err(WireError::Control(reply.message()));
        }
        let service_id = reply
            .value("ServiceID")
            .ok_or_else(|| WireError::Control("ServiceID missing from reply".into()))?;
        let address = OnionAddress::from_service_id(service_id)?;
        info!(address = %address, "Onion service published");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_parse_control_addr() {
        assert_eq!(
            ControlAddr::parse("tcp://127.0.0.1:9051").unwrap(),
            ControlAddr::Tcp("127.0.0.1:9051".into())
        );
        assert_eq!(
            ControlAddr::parse("localhost:9151").unwrap(),
            ControlAddr::Tcp("localhost:9151".into())
        );
        assert_eq!(
            ControlAddr::parse("unix:/run/tor/control").unwrap(),
            ControlAddr::Unix("/run/tor/control".into())
        );
        assert!(ControlAddr::parse("tcp://").is_err());
        assert!(ControlAddr::parse("nonsense").is_err());
    }

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("250 OK").unwrap(), (250, ' ', "OK"));
        assert_eq!(
            parse_reply_line("250-version=0.4.8.9").unwrap(),
            (250, '-', "version=0.4.8.9")
        );
        assert_eq!(parse_reply_line("515 Bad auth").unwrap().0, 515);
        assert!(parse_reply_line("25").is_err());
        assert!(parse_reply_line("abc OK").is_err());
        assert!(parse_reply_line("250*OK").is_err());
    }

    #[test]
    fn test_parse_auth_methods() {
        let reply = Reply {
            status: 250,
            lines: vec![
                "PROTOCOLINFO 1".into(),
                "AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"/var/run/tor/control.authcookie\""
                    .into(),
                "VERSION Tor=\"0.4.8.9\"".into(),
                "OK".into(),
            ],
        };
        let (methods, cookie) = parse_auth_methods(&reply);
        assert_eq!(methods, vec!["COOKIE", "SAFECOOKIE"]);
        assert_eq!(cookie.as_deref(), Some("/var/run/tor/control.authcookie"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    /// Scripted tor: answers each expected command with a canned reply.
    fn fake_tor(script: Vec<(&'static str, &'static str)>) -> TorControl {
        let (client, server) = duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            for (expected, reply) in script {
                let got = lines.next_line().await.unwrap().unwrap();
                assert!(
                    got.starts_with(expected),
                    "expected {expected:?}, got {got:?}"
                );
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        TorControl::from_stream(client)
    }

    #[tokio::test]
    async fn test_password_authentication() {
        let mut tor = fake_tor(vec![("AUTHENTICATE \"secret\"", "250 OK\r\n")]);
        tor.authenticate("secret").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_authentication() {
        let mut tor = fake_tor(vec![(
            "AUTHENTICATE",
            "515 Authentication failed: Password did not match\r\n",
        )]);
        let err = tor.authenticate("wrong").await.unwrap_err();
        assert!(matches!(err, WireError::ControlAuth(_)));
    }

    #[tokio::test]
    async fn test_null_authentication_via_protocolinfo() {
        let mut tor = fake_tor(vec![
            (
                "PROTOCOLINFO 1",
                "250-PROTOCOLINFO 1\r\n250-AUTH METHODS=NULL\r\n250-VERSION Tor=\"0.4.8.9\"\r\n250 OK\r\n",
            ),
            ("AUTHENTICATE", "250 OK\r\n"),
        ]);
        tor.authenticate("").await.unwrap();
    }

    #[tokio::test]
    async fn test_version_and_provision() {
        let mut tor = fake_tor(vec![
            ("GETINFO version", "250-version=0.4.8.9\r\n250 OK\r\n"),
            (
                "ADD_ONION ED25519-V3:",
                "250-ServiceID=abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx\r\n250 OK\r\n",
            ),
        ])
        .with_onion_port(80);

        assert_eq!(tor.version().await.unwrap(), "0.4.8.9");
        let address = tor.provision(41234, &[7u8; 32]).await.unwrap();
        assert_eq!(
            address.as_str(),
            "abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuvwx.onion"
        );
    }

    #[tokio::test]
    async fn test_data_reply_is_folded() {
        let mut tor = fake_tor(vec![(
            "GETINFO config-text",
            "250+config-text=\r\nSocksPort 9050\r\nControlPort 9051\r\n.\r\n250 OK\r\n",
        )]);
        let reply = tor.command("GETINFO config-text").await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(
            reply.value("config-text"),
            Some("\nSocksPort 9050\nControlPort 9051")
        );
    }
}
