//! Connection states and the transition table.

use std::fmt;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Idle, no local resources
    #[default]
    Null,

    /// Bound locally, remote peer not confirmed
    HalfOpen,

    /// Remote peer confirmed, media flowing
    Open,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Null => "NULL",
            ConnectionState::HalfOpen => "HALF_OPEN",
            ConnectionState::Open => "OPEN",
        };
        f.write_str(name)
    }
}

/// What drives a connection between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    Bind,
    Open,
    Close,
    Fail,
}

impl StateEvent {
    // ---
    /// Operation name used in error reports.
    pub fn operation(self) -> &'static str {
        // ---
        match self {
            StateEvent::Bind => "bind",
            StateEvent::Open => "open",
            StateEvent::Close => "close",
            StateEvent::Fail => "fail",
        }
    }
}

/// Outcome of looking up `(state, event)` in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state
    Next(ConnectionState),

    /// Nothing to do; the request is an idempotent no-op
    Ignore,

    /// Not allowed; carries the reason reported to the caller
    Illegal(&'static str),
}

impl ConnectionState {
    // ---
    /// The transition table.
    ///
    /// Close and fail on an idle connection are no-ops so teardown can be
    /// requested unconditionally.
    pub fn on(self, event: StateEvent) -> Transition {
        // ---
        use ConnectionState::*;

        match (self, event) {
            (Null, StateEvent::Bind) => Transition::Next(HalfOpen),
            (HalfOpen | Open, StateEvent::Bind) => Transition::Illegal("Connection already bound"),

            (HalfOpen, StateEvent::Open) => Transition::Next(Open),
            (Null, StateEvent::Open) => Transition::Illegal("Connection not bound yet"),
            (Open, StateEvent::Open) => Transition::Illegal("Connection opened already"),

            (HalfOpen | Open, StateEvent::Close | StateEvent::Fail) => Transition::Next(Null),
            (Null, StateEvent::Close | StateEvent::Fail) => Transition::Ignore,
        }
    }

    pub fn is_bound(self) -> bool {
        // ---
        self != ConnectionState::Null
    }
}

/// Seconds each state may last before the heartbeat fails the connection.
///
/// Zero disables the heartbeat for that state. `NULL` never has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTimeouts {
    // ---
    pub half_open_secs: u32,
    pub open_secs: u32,
}

impl Default for StateTimeouts {
    fn default() -> Self {
        // ---
        Self {
            half_open_secs: 30,
            open_secs: 300,
        }
    }
}

impl StateTimeouts {
    // ---
    pub fn timeout(&self, state: ConnectionState) -> u32 {
        // ---
        match state {
            ConnectionState::Null => 0,
            ConnectionState::HalfOpen => self.half_open_secs,
            ConnectionState::Open => self.open_secs,
        }
    }

    /// Heartbeat ticks granted on entering `state`: `timeout * resolution + 1`,
    /// or zero when the state has no timeout.
    pub fn ttl(&self, state: ConnectionState, resolution: u32) -> u64 {
        // ---
        match self.timeout(state) {
            0 => 0,
            secs => secs as u64 * resolution as u64 + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_bind_only_from_null() {
        // ---
        assert_eq!(
            ConnectionState::Null.on(StateEvent::Bind),
            Transition::Next(ConnectionState::HalfOpen)
        );
        assert_eq!(
            ConnectionState::HalfOpen.on(StateEvent::Bind),
            Transition::Illegal("Connection already bound")
        );
        assert_eq!(
            ConnectionState::Open.on(StateEvent::Bind),
            Transition::Illegal("Connection already bound")
        );
    }

    #[test]
    fn test_open_reasons() {
        // ---
        assert_eq!(
            ConnectionState::Null.on(StateEvent::Open),
            Transition::Illegal("Connection not bound yet")
        );
        assert_eq!(
            ConnectionState::Open.on(StateEvent::Open),
            Transition::Illegal("Connection opened already")
        );
        assert_eq!(
            ConnectionState::HalfOpen.on(StateEvent::Open),
            Transition::Next(ConnectionState::Open)
        );
    }

    #[test]
    fn test_teardown_returns_to_null() {
        // ---
        for state in [ConnectionState::HalfOpen, ConnectionState::Open] {
            for event in [StateEvent::Close, StateEvent::Fail] {
                assert_eq!(state.on(event), Transition::Next(ConnectionState::Null));
            }
        }
        assert_eq!(ConnectionState::Null.on(StateEvent::Close), Transition::Ignore);
        assert_eq!(ConnectionState::Null.on(StateEvent::Fail), Transition::Ignore);
    }

    #[test]
    fn test_ttl_formula() {
        // ---
        let timeouts = StateTimeouts {
            half_open_secs: 3,
            open_secs: 0,
        };
        assert_eq!(timeouts.ttl(ConnectionState::HalfOpen, 10), 31);
        assert_eq!(timeouts.ttl(ConnectionState::Open, 10), 0);
        assert_eq!(timeouts.ttl(ConnectionState::Null, 10), 0);
    }

    #[test]
    fn test_display() {
        // ---
        assert_eq!(ConnectionState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
