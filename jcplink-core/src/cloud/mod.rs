//! Cloud API client module
//!
//! The authenticating connectivity client and the pieces it is built from:
//! connection states and events, the HTTP transport with its relaxed TLS
//! fallback, reachability probing and request/response values.

pub mod client;
pub mod events;
pub mod reachability;
pub mod request;
pub mod state;
pub mod transport;

pub use client::CloudClient;
pub use events::{ConnectionEvent, EventHub, ListenerId, LoginEvent};
pub use reachability::{ProbeReport, ProbeTarget, Unreachable};
pub use request::{ApiRequest, ApiResponse, Method};
pub use state::ConnectionState;
