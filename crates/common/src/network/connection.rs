use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::crypto::PublicKey;

/// Lifecycle of one swarm connection
///
/// `Connecting -> Connected -> (Reconnecting <-> Connected) -> Disconnected | Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    /// The remote went away and this side does not dial it
    Disconnected,
    /// Torn down locally
    Closed,
}

/// Observable state of a connection to one peer
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote: PublicKey,
    pub state: ConnectionState,
    pub last_state_change: DateTime<Utc>,
    /// Delay before the next dial attempt, while reconnecting
    pub reconnect_in: Option<Duration>,
    /// Failed dials since the last successful connection
    pub attempts: usize,
    pub is_initiator: bool,
}

impl ConnectionInfo {
    pub fn new(remote: PublicKey, is_initiator: bool) -> Self {
        Self {
            remote,
            state: ConnectionState::Connecting,
            last_state_change: Utc::now(),
            reconnect_in: None,
            attempts: 0,
            is_initiator,
        }
    }

    pub fn transition(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(
                "connection to {}: {:?} -> {:?}",
                self.remote.short(),
                self.state,
                state
            );
            self.state = state;
            self.last_state_change = Utc::now();
        }
        if state != ConnectionState::Reconnecting {
            self.reconnect_in = None;
        }
    }
}
