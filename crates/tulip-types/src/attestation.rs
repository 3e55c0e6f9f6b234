//! Identity attestations: values that prove who a peer is.
//!
//! An [`Attestation`] is a closed set of kinds, each carrying its own typed
//! payload, so a fingerprint can never be compared against an onion address
//! by accident.

use crate::error::{TulipError, TulipResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a peer fingerprint in bytes (40 hex characters).
pub const FINGERPRINT_LEN: usize = 20;

/// Suffix every onion address carries.
pub const ONION_SUFFIX: &str = ".onion";

/// Kind tag of an attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationKind {
    /// Fingerprint of the peer's long-term channel key.
    Fingerprint,
    /// The peer's onion service address.
    OnionAddress,
}

impl AttestationKind {
    /// Parse a kind tag as typed by the operator or written in config.
    ///
    /// `otr-fp` is accepted as a synonym of `fp`.
    pub fn parse(kind: &str) -> TulipResult<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "fp" | "otr-fp" | "fingerprint" => Ok(Self::Fingerprint),
            "onion" | "onion-address" => Ok(Self::OnionAddress),
            other => Err(TulipError::UnknownKind(other.to_string())),
        }
    }

    /// Short tag used when displaying entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fingerprint => "fp",
            Self::OnionAddress => "onion",
        }
    }
}

impl fmt::Display for AttestationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fingerprint of a peer's long-term public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(Vec<u8>);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Fingerprint a public key: the first 20 bytes of its SHA-256 digest.
    pub fn of_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        Self(digest[..FINGERPRINT_LEN].to_vec())
    }

    /// Parse a hex-encoded fingerprint.
    pub fn from_hex(value: &str) -> TulipResult<Self> {
        let bytes = hex::decode(value.trim()).map_err(|_| TulipError::InvalidAttestation {
            kind: AttestationKind::Fingerprint.to_string(),
            value: value.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(TulipError::InvalidAttestation {
                kind: AttestationKind::Fingerprint.to_string(),
                value: value.to_string(),
            });
        }
        Ok(Self(bytes))
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A validated onion service address, always lowercase and `.onion`-suffixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OnionAddress(String);

impl OnionAddress {
    /// Parse an onion address. The host label must be non-empty base32.
    pub fn parse(value: &str) -> TulipResult<Self> {
        let lowered = value.trim().to_ascii_lowercase();
        let host = lowered
            .strip_suffix(ONION_SUFFIX)
            .ok_or_else(|| TulipError::InvalidAddress(value.to_string()))?;
        let valid_label = !host.is_empty()
            && host
                .chars()
                .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c));
        if !valid_label {
            return Err(TulipError::InvalidAddress(value.to_string()));
        }
        Ok(Self(lowered))
    }

    /// Build an address from a bare service id as returned by tor.
    pub fn from_service_id(service_id: &str) -> TulipResult<Self> {
        Self::parse(&format!("{service_id}{ONION_SUFFIX}"))
    }

    /// The full address including the suffix.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OnionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed attestation value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attestation {
    Fingerprint(Fingerprint),
    OnionAddress(OnionAddress),
}

impl Attestation {
    /// Parse a `(value, kind)` pair.
    pub fn parse(value: &str, kind: &str) -> TulipResult<Self> {
        match AttestationKind::parse(kind)? {
            AttestationKind::Fingerprint => Fingerprint::from_hex(value).map(Self::Fingerprint),
            AttestationKind::OnionAddress => OnionAddress::parse(value).map(Self::OnionAddress),
        }
    }

    pub fn kind(&self) -> AttestationKind {
        match self {
            Self::Fingerprint(_) => AttestationKind::Fingerprint,
            Self::OnionAddress(_) => AttestationKind::OnionAddress,
        }
    }

    /// The value as it would be typed by the operator.
    pub fn value(&self) -> String {
        match self {
            Self::Fingerprint(fp) => fp.to_hex(),
            Self::OnionAddress(addr) => addr.to_string(),
        }
    }
}

impl fmt::Display for Attestation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value(), self.kind())
    }
}
