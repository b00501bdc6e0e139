//! Cloud client connection states

/// Connection state of the cloud client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,

    /// First connection attempt in progress
    Connecting,

    /// The APIs are not reachable, waiting for the retry timer
    ConnectingWaitingDependency,

    /// The identity provider is not reachable, waiting for the retry timer
    ConnectingWaitingAuth,

    /// Connected with the client-credentials flow
    ConnectedAnonymous,

    /// Connected with the auth-code (user) flow
    ConnectedLogged,

    /// Tearing down the connection
    Disconnecting,
}

impl ConnectionState {
    /// True for both connected variants
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedAnonymous | ConnectionState::ConnectedLogged
        )
    }

    /// True for the first attempt and both waiting variants
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::ConnectingWaitingDependency
                | ConnectionState::ConnectingWaitingAuth
        )
    }

    /// True for the states that keep the connection retry timer alive
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectingWaitingDependency | ConnectionState::ConnectingWaitingAuth
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectingWaitingDependency => "connecting (waiting APIs)",
            ConnectionState::ConnectingWaitingAuth => "connecting (waiting auth)",
            ConnectionState::ConnectedAnonymous => "connected (anonymous)",
            ConnectionState::ConnectedLogged => "connected (logged)",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}
