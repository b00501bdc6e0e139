//! Gateway tunnel states and lifecycle events

use std::fmt;

/// Connection state of a gateway tunnel client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayState {
    #[default]
    Disconnected,
    Connecting,
    /// The cloud client is not connected yet; waiting for it to connect
    WaitingOnDependency,
    /// A connection attempt failed; the reconnect timer is scheduled
    WaitingToRetry,
    Connected,
    Disconnecting,
}

impl GatewayState {
    pub fn is_connected(&self) -> bool {
        matches!(self, GatewayState::Connected)
    }

    /// True while an attempt is in progress or pending
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            GatewayState::Connecting | GatewayState::WaitingOnDependency | GatewayState::WaitingToRetry
        )
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, GatewayState::WaitingOnDependency | GatewayState::WaitingToRetry)
    }
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayState::Disconnected => "DISCONNECTED",
            GatewayState::Connecting => "CONNECTING",
            GatewayState::WaitingOnDependency => "CONNECTING_WAITING_DEPENDENCY",
            GatewayState::WaitingToRetry => "CONNECTING_WAITING_RETRY",
            GatewayState::Connected => "CONNECTED",
            GatewayState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Why a tunnel ended up disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called
    LocalRequest,
    /// The established peer was closed by the remote or the network
    RemoteDrop,
    /// An attempt ended without ever opening a peer
    NeverConnected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisconnectReason::LocalRequest => "local request",
            DisconnectReason::RemoteDrop => "remote drop",
            DisconnectReason::NeverConnected => "never connected",
        };
        f.write_str(name)
    }
}

/// Lifecycle events emitted by the gateway tunnel client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Connecting,
    Waiting,
    Connected,
    Disconnecting,
    Disconnected { reason: DisconnectReason },
    Failed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(GatewayState::Connected.is_connected());
        assert!(!GatewayState::Connected.is_connecting());

        for state in [
            GatewayState::Connecting,
            GatewayState::WaitingOnDependency,
            GatewayState::WaitingToRetry,
        ] {
            assert!(state.is_connecting(), "{} should be connecting", state);
            assert!(!state.is_connected());
        }

        assert!(GatewayState::WaitingToRetry.is_waiting());
        assert!(!GatewayState::Connecting.is_waiting());
        assert_eq!(GatewayState::default(), GatewayState::Disconnected);
    }
}
