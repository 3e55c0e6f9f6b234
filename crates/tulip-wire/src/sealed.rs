//! The channel engine tulip ships with.
//!
//! ## Handshake
//!
//! 1. Any outbound line on an unbound channel emits `hello`: our identity key,
//!    a fresh X25519 ephemeral key and an ed25519 signature over it.
//! 2. A peer receiving `hello` answers with its own `hello` if it has not sent
//!    one. Both sides derive directional AES-256-GCM keys from the X25519
//!    shared secret with HKDF-SHA256, mixing both ephemeral and both identity
//!    keys into the derivation, and send `confirm`: a fixed string sealed
//!    under their sending key.
//! 3. The peer identity is bound, and `GoneSecure` raised, only once the
//!    peer's `confirm` opens. A replayed `hello` carries a valid signature but
//!    its sender cannot produce `confirm`, so it never binds.
//! 4. Lines submitted before the handshake finished are sealed and flushed
//!    right after the peer's `confirm`.
//!
//! Data packets carry a strictly increasing per-direction counter that doubles
//! as the GCM nonce. An `end` packet from the peer raises `GoneInsecure`.

use crate::channel::{
    ChannelError, ChannelFactory, Exchange, SecureChannel, SecurityEvent, SecurityState,
};
use crate::fragment::{classify, fragment, Piece, Reassembler, MESSAGE_PREFIX};
use crate::keys::{verify, LocalIdentity};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::debug;
use tulip_types::Fingerprint;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

const HELLO_CONTEXT: &[u8] = b"tulip/v1/hello";
const SESSION_SALT: &[u8] = b"tulip/v1/session";
const CONFIRM_CONTEXT: &[u8] = b"tulip/v1/confirm";
/// Data counters start at 1, so nonce 0 is reserved for `confirm`.
const CONFIRM_COUNTER: u64 = 0;

/// Lines held while the handshake is in flight.
pub const MAX_HELD_MESSAGES: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
enum Packet {
    Hello {
        identity: String,
        ephemeral: String,
        signature: String,
    },
    Confirm {
        body: String,
    },
    Data {
        counter: u64,
        body: String,
    },
    End,
}

impl Packet {
    fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Confirm { .. } => "confirm",
            Self::Data { .. } => "data",
            Self::End => "end",
        }
    }
}

struct SessionKeys {
    send: Aes256Gcm,
    recv: Aes256Gcm,
    sent: u64,
    received: u64,
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn decode_array<const N: usize>(field: &str, value: &str) -> Result<[u8; N], ChannelError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| ChannelError::Malformed(format!("{field}: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ChannelError::Malformed(format!("{field}: expected {N} bytes")))
}

/// Channel engine bound to one local identity.
pub struct SealedChannel {
    identity: Arc<LocalIdentity>,
    fragment_size: usize,
    state: SecurityState,
    ephemeral: Option<EphemeralSecret>,
    ephemeral_public: [u8; 32],
    hello_sent: bool,
    keys: Option<SessionKeys>,
    /// Identity from a verified `hello`, not yet backed by `confirm`.
    claimed: Option<Fingerprint>,
    peer: Option<Fingerprint>,
    held: Vec<String>,
    reassembler: Reassembler,
    events: Vec<SecurityEvent>,
}

impl SealedChannel {
    pub fn new(identity: Arc<LocalIdentity>, fragment_size: usize) -> Self {
        let ephemeral = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        Self {
            identity,
            fragment_size,
            state: SecurityState::Unbound,
            ephemeral: Some(ephemeral),
            ephemeral_public,
            hello_sent: false,
            keys: None,
            claimed: None,
            peer: None,
            held: Vec::new(),
            reassembler: Reassembler::new(),
            events: Vec::new(),
        }
    }

    /// End the conversation: returns the `end` fragments for the peer.
    pub fn end(&mut self) -> Result<Vec<String>, ChannelError> {
        if self.state == SecurityState::Ended {
            return Err(ChannelError::Ended);
        }
        let out = self.encode(&Packet::End)?;
        self.finish();
        Ok(out)
    }

    fn finish(&mut self) {
        self.state = SecurityState::Ended;
        self.keys = None;
        self.claimed = None;
        self.held.clear();
        self.events.push(SecurityEvent::GoneInsecure);
    }

    fn encode(&self, packet: &Packet) -> Result<Vec<String>, ChannelError> {
        let json = serde_json::to_vec(packet).map_err(|e| ChannelError::Malformed(e.to_string()))?;
        let message = format!("{MESSAGE_PREFIX}{}", STANDARD.encode(json));
        Ok(fragment(&message, self.fragment_size))
    }

    fn hello(&mut self) -> Result<Vec<String>, ChannelError> {
        let mut signed = HELLO_CONTEXT.to_vec();
        signed.extend_from_slice(&self.ephemeral_public);
        let packet = Packet::Hello {
            identity: STANDARD.encode(self.identity.public_key()),
            ephemeral: STANDARD.encode(self.ephemeral_public),
            signature: STANDARD.encode(self.identity.sign(&signed)),
        };
        self.hello_sent = true;
        self.encode(&packet)
    }

    fn hold(&mut self, plaintext: &str) -> Result<(), ChannelError> {
        if plaintext.is_empty() {
            return Ok(());
        }
        if self.held.len() >= MAX_HELD_MESSAGES {
            return Err(ChannelError::Backlog(MAX_HELD_MESSAGES));
        }
        self.held.push(plaintext.to_string());
        Ok(())
    }

    fn seal(&mut self, plaintext: &str) -> Result<Vec<String>, ChannelError> {
        let keys = self.keys.as_mut().ok_or(ChannelError::UnexpectedPacket {
            packet: "data",
            state: self.state,
        })?;
        keys.sent += 1;
        let counter = keys.sent;
        let body = keys
            .send
            .encrypt(Nonce::from_slice(&nonce_bytes(counter)), plaintext.as_bytes())
            .map_err(|_| ChannelError::Malformed("encryption failed".into()))?;
        self.encode(&Packet::Data {
            counter,
            body: STANDARD.encode(body),
        })
    }

    fn open(&mut self, counter: u64, body: &str) -> Result<String, ChannelError> {
        let state = self.state;
        let unexpected = ChannelError::UnexpectedPacket {
            packet: "data",
            state,
        };
        if state != SecurityState::Secure {
            return Err(unexpected);
        }
        let keys = self.keys.as_mut().ok_or(unexpected)?;
        if counter <= keys.received {
            return Err(ChannelError::Replay {
                counter,
                last: keys.received,
            });
        }
        let ciphertext = STANDARD
            .decode(body)
            .map_err(|e| ChannelError::Malformed(format!("body: {e}")))?;
        let plaintext = keys
            .recv
            .decrypt(Nonce::from_slice(&nonce_bytes(counter)), ciphertext.as_ref())
            .map_err(|_| ChannelError::Decrypt)?;
        keys.received = counter;
        String::from_utf8(plaintext).map_err(|_| ChannelError::Malformed("body is not UTF-8".into()))
    }

    fn accept_hello(
        &mut self,
        identity: &str,
        ephemeral: &str,
        signature: &str,
    ) -> Result<Vec<String>, ChannelError> {
        if self.keys.is_some() || self.state == SecurityState::Ended {
            return Err(ChannelError::UnexpectedPacket {
                packet: "hello",
                state: self.state,
            });
        }

        let peer_identity: [u8; 32] = decode_array("identity", identity)?;
        let peer_ephemeral: [u8; 32] = decode_array("ephemeral", ephemeral)?;
        let signature: [u8; 64] = decode_array("signature", signature)?;

        let mut signed = HELLO_CONTEXT.to_vec();
        signed.extend_from_slice(&peer_ephemeral);
        if !verify(&peer_identity, &signed, &signature) {
            return Err(ChannelError::Authentication("bad hello signature".into()));
        }

        let secret = self.ephemeral.take().ok_or(ChannelError::UnexpectedPacket {
            packet: "hello",
            state: self.state,
        })?;
        let shared = secret.diffie_hellman(&PublicKey::from(peer_ephemeral));
        if !shared.was_contributory() {
            return Err(ChannelError::Authentication(
                "non-contributory key exchange".into(),
            ));
        }

        // Both sides order the transcript by ephemeral key, so they agree on
        // the info string and on which half of the output each direction uses.
        let ours = (self.ephemeral_public, self.identity.public_key());
        let theirs = (peer_ephemeral, peer_identity);
        let ours_first = ours.0 < theirs.0;
        let (low, high) = if ours_first { (ours, theirs) } else { (theirs, ours) };
        let mut info = Vec::with_capacity(128);
        for (ephemeral, identity) in [low, high] {
            info.extend_from_slice(&ephemeral);
            info.extend_from_slice(&identity);
        }

        let mut okm = Zeroizing::new([0u8; 64]);
        Hkdf::<Sha256>::new(Some(SESSION_SALT), shared.as_bytes())
            .expand(&info, &mut okm[..])
            .map_err(|e| ChannelError::Malformed(e.to_string()))?;
        let (first, second) = okm.split_at(32);
        let (send_key, recv_key) = if ours_first {
            (first, second)
        } else {
            (second, first)
        };
        let cipher = |key: &[u8]| {
            Aes256Gcm::new_from_slice(key).map_err(|e| ChannelError::Malformed(e.to_string()))
        };

        let mut out = Vec::new();
        if !self.hello_sent {
            out.extend(self.hello()?);
        }

        let keys = SessionKeys {
            send: cipher(send_key)?,
            recv: cipher(recv_key)?,
            sent: 0,
            received: 0,
        };
        let confirm = keys
            .send
            .encrypt(Nonce::from_slice(&nonce_bytes(CONFIRM_COUNTER)), CONFIRM_CONTEXT)
            .map_err(|_| ChannelError::Malformed("encryption failed".into()))?;
        self.keys = Some(keys);
        self.claimed = Some(Fingerprint::of_public_key(&peer_identity));
        self.state = SecurityState::HandshakeInProgress;
        out.extend(self.encode(&Packet::Confirm {
            body: STANDARD.encode(confirm),
        })?);
        Ok(out)
    }

    fn accept_confirm(&mut self, body: &str) -> Result<Vec<String>, ChannelError> {
        let state = self.state;
        let unexpected = ChannelError::UnexpectedPacket {
            packet: "confirm",
            state,
        };
        if state != SecurityState::HandshakeInProgress {
            return Err(unexpected);
        }
        let keys = self.keys.as_ref().ok_or(unexpected)?;
        let ciphertext = STANDARD
            .decode(body)
            .map_err(|e| ChannelError::Malformed(format!("confirm: {e}")))?;
        let opened = keys
            .recv
            .decrypt(Nonce::from_slice(&nonce_bytes(CONFIRM_COUNTER)), ciphertext.as_ref())
            .map_err(|_| ChannelError::Authentication("key confirmation failed".into()))?;
        if opened != CONFIRM_CONTEXT {
            return Err(ChannelError::Authentication("key confirmation failed".into()));
        }

        let fingerprint = self.claimed.take().ok_or(ChannelError::UnexpectedPacket {
            packet: "confirm",
            state,
        })?;
        debug!(peer = %fingerprint, "Channel secure");
        self.peer = Some(fingerprint);
        self.state = SecurityState::Secure;
        self.events.push(SecurityEvent::GoneSecure);

        let mut out = Vec::new();
        for line in std::mem::take(&mut self.held) {
            out.extend(self.seal(&line)?);
        }
        Ok(out)
    }

    fn process(&mut self, body: &str) -> Result<Exchange, ChannelError> {
        let json = STANDARD
            .decode(body)
            .map_err(|e| ChannelError::Malformed(format!("encoding: {e}")))?;
        let packet: Packet =
            serde_json::from_slice(&json).map_err(|e| ChannelError::Malformed(e.to_string()))?;

        match packet {
            Packet::Hello {
                identity,
                ephemeral,
                signature,
            } => Ok(Exchange {
                plaintext: None,
                fragments: self.accept_hello(&identity, &ephemeral, &signature)?,
            }),
            Packet::Confirm { body } => Ok(Exchange {
                plaintext: None,
                fragments: self.accept_confirm(&body)?,
            }),
            Packet::Data { counter, body } => Ok(Exchange {
                plaintext: Some(self.open(counter, &body)?),
                fragments: Vec::new(),
            }),
            packet @ Packet::End => {
                if self.state != SecurityState::Secure {
                    return Err(ChannelError::UnexpectedPacket {
                        packet: packet.name(),
                        state: self.state,
                    });
                }
                self.finish();
                Ok(Exchange::default())
            }
        }
    }
}

impl SecureChannel for SealedChannel {
    fn receive(&mut self, message: &str) -> Result<Exchange, ChannelError> {
        if self.state == SecurityState::Ended {
            return Err(ChannelError::Ended);
        }
        match classify(message)? {
            Piece::Whole(body) => self.process(body),
            Piece::Fragment {
                index,
                total,
                chunk,
            } => match self.reassembler.push(index, total, chunk)? {
                None => Ok(Exchange::default()),
                Some(whole) => match classify(&whole)? {
                    Piece::Whole(body) => self.process(body),
                    Piece::Fragment { .. } => {
                        Err(ChannelError::Malformed("nested fragment".into()))
                    }
                },
            },
        }
    }

    fn send(&mut self, plaintext: &str) -> Result<Vec<String>, ChannelError> {
        match self.state {
            SecurityState::Ended => Err(ChannelError::Ended),
            SecurityState::Secure if plaintext.is_empty() => Ok(Vec::new()),
            SecurityState::Secure => self.seal(plaintext),
            SecurityState::Unbound => {
                self.hold(plaintext)?;
                self.state = SecurityState::HandshakeInProgress;
                self.hello()
            }
            SecurityState::HandshakeInProgress => {
                self.hold(plaintext)?;
                Ok(Vec::new())
            }
        }
    }

    fn take_events(&mut self) -> Vec<SecurityEvent> {
        std::mem::take(&mut self.events)
    }

    fn peer_identity(&self) -> Option<Fingerprint> {
        self.peer.clone()
    }

    fn state(&self) -> SecurityState {
        self.state
    }
}

/// Opens a [`SealedChannel`] per talk.
pub struct SealedChannelFactory {
    identity: Arc<LocalIdentity>,
    fragment_size: usize,
}

impl SealedChannelFactory {
    pub fn new(identity: Arc<LocalIdentity>, fragment_size: usize) -> Self {
        Self {
            identity,
            fragment_size,
        }
    }
}

impl ChannelFactory for SealedChannelFactory {
    fn open(&self) -> Box<dyn SecureChannel> {
        Box::new(SealedChannel::new(
            Arc::clone(&self.identity),
            self.fragment_size,
        ))
    }
}
