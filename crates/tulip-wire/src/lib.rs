//! tulip session core: encrypted peer talks over onion-routed WebSockets.
//!
//! ## Architecture
//!
//! - **AddressBook**: aliases mapped to identity attestations
//! - **SecureChannel**: per-talk protocol engine (trait) and [`SealedChannel`]
//! - **Transport**: framed duplex connection (WebSocket or in-memory)
//! - **Talk**: the per-peer actor pumping frames between transport and channel
//! - **SessionRegistry**: display alias to live talk, reconciled by one owner
//! - **SessionNode**: accepts inbound talks and dials outbound ones
//! - **TorControl**: onion service provisioning over the tor control port

pub mod address_book;
pub mod channel;
pub mod error;
pub mod fragment;
pub mod keys;
pub mod node;
pub mod onion;
pub mod registry;
pub mod sealed;
pub mod talk;
pub mod transport;

pub use address_book::{AddressBook, Person};
pub use channel::{ChannelError, ChannelFactory, Exchange, SecureChannel, SecurityEvent, SecurityState};
pub use error::WireError;
pub use keys::LocalIdentity;
pub use node::{NewTalk, ProxyDialer, SessionNode, SocksDialer};
pub use onion::{OnionProvisioner, TorControl};
pub use registry::{Reconciliation, RegistryEntry, SessionRegistry};
pub use sealed::{SealedChannel, SealedChannelFactory};
pub use talk::{ConnectEvent, Talk, TalkConfig, TalkId, TalkOrigin};
pub use transport::{Frame, FrameSink, FrameSource, Transport};
