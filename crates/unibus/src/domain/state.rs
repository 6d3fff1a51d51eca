//! Connection state shared by every adapter.
//!
//! ```text
//!  Disconnected ──connect──▶ Connected ──connection lost──▶ Reconnecting
//!       ▲                        │  ▲                            │
//!       └──────disconnect────────┘  └──────attempt succeeds──────┘
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(label)
    }
}

/// Shared, observable connection state.
#[derive(Debug, Clone)]
pub struct StateCell {
    system: &'static str,
    state: Arc<RwLock<ConnectionState>>,
}

impl StateCell {
    pub fn new(system: &'static str) -> Self {
        Self {
            system,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Move to `next`, returning the previous state.
    pub fn set(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.state.write();
        let previous = *state;
        if previous != next {
            *state = next;
            info!(
                system = self.system,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
        }
        previous
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.get() == ConnectionState::Connected
    }
}
