//! Core types for tulip.
//!
//! This crate defines the data structures shared by the session core and the
//! command-line front end. It contains no I/O.

pub mod attestation;
pub mod config;
pub mod error;

pub use attestation::{Attestation, AttestationKind, Fingerprint, OnionAddress};
pub use config::{ContactEntry, TulipConfig};
pub use error::{TulipError, TulipResult};
