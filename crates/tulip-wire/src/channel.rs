//! The secure channel capability consumed by a talk.
//!
//! A [`SecureChannel`] is a stateful protocol engine. The talk feeds it every
//! inbound transport message and every outbound plaintext line; the engine
//! answers with plaintext for the operator and ciphertext fragments for the
//! wire. Security state changes are queued inside the engine and drained with
//! [`SecureChannel::take_events`] after each call.

use std::fmt;
use thiserror::Error;
use tulip_types::Fingerprint;

/// Lifecycle of a channel. Owned by the engine; talks only observe events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Unbound,
    HandshakeInProgress,
    Secure,
    Ended,
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::HandshakeInProgress => "handshake",
            Self::Secure => "secure",
            Self::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// A security state transition raised by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    /// The handshake completed and the peer identity is bound.
    GoneSecure,
    /// The peer ended the conversation.
    GoneInsecure,
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoneSecure => f.write_str("GoneSecure"),
            Self::GoneInsecure => f.write_str("GoneInsecure"),
        }
    }
}

/// Protocol processing errors. Never fatal to a talk.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unencrypted message refused")]
    Unencrypted,
    #[error("Fragment out of order: got {got}/{total}, expected {expected}")]
    FragmentOrder {
        got: usize,
        total: usize,
        expected: usize,
    },
    #[error("Message too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Peer authentication failed: {0}")]
    Authentication(String),
    #[error("Decryption failed")]
    Decrypt,
    #[error("Replayed or reordered message (counter {counter}, last {last})")]
    Replay { counter: u64, last: u64 },
    #[error("Unexpected {packet} in state {state}")]
    UnexpectedPacket {
        packet: &'static str,
        state: SecurityState,
    },
    #[error("Too many messages waiting for the handshake (max {0})")]
    Backlog(usize),
    #[error("Conversation has ended")]
    Ended,
}

/// Result of feeding one inbound message to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Decrypted text for the operator, if the message carried any.
    pub plaintext: Option<String>,
    /// Ciphertext fragments to write back to the peer, in order.
    pub fragments: Vec<String>,
}

/// Per-talk protocol engine.
///
/// Implementations are not required to be internally synchronized; the talk
/// serializes every call.
pub trait SecureChannel: Send {
    /// Process one inbound transport message.
    fn receive(&mut self, message: &str) -> Result<Exchange, ChannelError>;

    /// Encrypt one outbound plaintext line into ciphertext fragments.
    ///
    /// An empty line produces no data but starts the handshake if the channel
    /// is not yet secure.
    fn send(&mut self, plaintext: &str) -> Result<Vec<String>, ChannelError>;

    /// Drain security events raised since the last call.
    fn take_events(&mut self) -> Vec<SecurityEvent>;

    /// The peer's durable identity, once bound.
    fn peer_identity(&self) -> Option<Fingerprint>;

    fn state(&self) -> SecurityState;
}

/// Creates a fresh channel bound to the local long-term identity for every
/// new talk.
pub trait ChannelFactory: Send + Sync + 'static {
    fn open(&self) -> Box<dyn SecureChannel>;
}
