//! Gateway tunnel client module
//!
//! A tunnel to a remote peer routed through a cloud gateway. The tunnel
//! depends on the cloud client for its access info and waits for it when
//! offline. Relay protocol specifics plug in through [`AccessInfoSource`]
//! and [`PeerOpener`].

pub mod access;
pub mod client;
pub mod identity;
pub mod peer;
pub mod state;
pub mod trust;

pub use access::{AccessInfoSource, CloudAccessInfoSource, TunnelAccessInfo};
pub use client::GatewayClient;
pub use identity::LocalIdentity;
pub use peer::{PeerOpener, PeerSettings, SecurePeer, TlsPeerOpener};
pub use state::{DisconnectReason, GatewayEvent, GatewayState};
pub use trust::{CertKeystore, DynTrustStore, GATEWAY_CERT_ALIAS};
