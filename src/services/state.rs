use std::fmt;

/// Lifecycle of one service connection.
///
/// `Unconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`,
/// with `Failed` reachable from `Connecting` once the connect budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting { attempt: u32 },
    Connected,
    Disconnecting,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// `connect()` stops waiting once a unit reaches one of these.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Connected | Self::Failed | Self::Disconnected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
