//! Passphrase-derived keys.
//!
//! Identity and onion keys are reproducible from a passphrase: Argon2id
//! stretches the passphrase into a 32-byte seed, domain-separated by a
//! per-purpose `info` string.

use crate::error::WireError;
use argon2::Argon2;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};
use tulip_types::Fingerprint;
use zeroize::Zeroizing;

/// Domain separation for the long-term channel identity.
pub const IDENTITY_INFO: &[u8] = b"tulip-identity-keygen";

/// Domain separation for the onion service key.
pub const ONION_INFO: &[u8] = b"tulip-onion-keygen";

const SALT_PREFIX: &[u8] = b"tulip/v1/keygen-salt/";

/// Stretch a passphrase into a 32-byte seed for the given purpose.
pub fn derive_seed(passphrase: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>, WireError> {
    let mut salt = Vec::with_capacity(SALT_PREFIX.len() + info.len());
    salt.extend_from_slice(SALT_PREFIX);
    salt.extend_from_slice(info);

    let mut seed = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase, &salt, &mut seed[..])
        .map_err(|e| WireError::KeyDerivation(e.to_string()))?;
    Ok(seed)
}

/// Expand a seed into the 64-byte clamped ed25519 secret that tor's
/// `ADD_ONION ED25519-V3:` expects.
pub fn expand_onion_key(seed: &[u8; 32]) -> Zeroizing<[u8; 64]> {
    let digest = Sha512::digest(seed);
    let mut expanded = Zeroizing::new([0u8; 64]);
    expanded.copy_from_slice(&digest);
    expanded[0] &= 248;
    expanded[31] &= 127;
    expanded[31] |= 64;
    expanded
}

/// The local long-term identity every new channel is bound to.
pub struct LocalIdentity {
    signing: SigningKey,
}

impl LocalIdentity {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Derive the identity from a passphrase.
    pub fn from_passphrase(passphrase: &[u8]) -> Result<Self, WireError> {
        let seed = derive_seed(passphrase, IDENTITY_INFO)?;
        Ok(Self::from_seed(&seed))
    }

    /// A random identity, for tests and throwaway sessions.
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

/// Check an ed25519 signature made by `public_key`.
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}
