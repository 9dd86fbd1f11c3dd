//! Connection State Machine
//!
//! Defines the valid connection lifecycle transitions for one peripheral.
//! `Disconnected` is terminal: a session that has dropped its link is
//! retired and a fresh session takes over for the next connect.

use crate::now_ms;

/// Lifecycle of one peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connect has been requested yet
    Idle,
    /// A physical connect is in flight
    Connecting,
    /// Handshake and discovery succeeded
    Connected,
    /// The connect failed or the link dropped
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Events that can trigger connection state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A caller asked for a connection
    ConnectRequested,
    /// Handshake and service discovery completed
    Established,
    /// The physical connect failed or timed out
    ConnectFailed,
    /// The transport reported the link as dropped
    LinkLost,
    /// The session released the link on purpose
    Released,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was valid and state changed
    Success(ConnectionState),
    /// Event accepted but state is unchanged (idempotent connect)
    Unchanged(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The connection state machine for one peripheral
#[derive(Debug)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
    last_change_ms: u64,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Idle,
            last_change_ms: now_ms(),
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Timestamp of the last state change
    pub fn last_change_ms(&self) -> u64 {
        self.last_change_ms
    }

    /// Whether this connection can never be used again
    pub fn is_terminal(&self) -> bool {
        self.current_state == ConnectionState::Disconnected
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        use ConnectionState::*;

        // Repeated connect requests collapse onto the current attempt
        if event == LinkEvent::ConnectRequested && matches!(self.current_state, Connecting | Connected) {
            return TransitionResult::Unchanged(self.current_state);
        }

        match self.get_next_state(event) {
            Some(state) => {
                self.current_state = state;
                self.last_change_ms = now_ms();
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.current_state, event) {
            // From Idle
            (Idle, ConnectRequested) => Some(Connecting),

            // From Connecting
            (Connecting, Established) => Some(Connected),
            (Connecting, ConnectFailed | LinkLost | Released) => Some(Disconnected),

            // From Connected
            (Connected, LinkLost | Released) => Some(Disconnected),

            // Disconnected is terminal
            _ => None,
        }
    }
}

/// Check if a transition from one state to another is allowed
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (from, to),
        (Idle, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
    )
}
