//! Stream half-duplex state machine.

/// `Idle → Open → HalfClosed(local|remote) → Closed`, driven by send and
/// receive completion signaled by the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// Outcome of finishing one direction: the state to record, and whether both
/// directions are now done (the stream should settle gracefully).
pub(crate) fn advance_local(state: StreamState) -> (StreamState, bool) {
    match state {
        StreamState::Idle | StreamState::Open => (StreamState::HalfClosedLocal, false),
        StreamState::HalfClosedRemote => (StreamState::HalfClosedRemote, true),
        s => (s, false),
    }
}

pub(crate) fn advance_remote(state: StreamState) -> (StreamState, bool) {
    match state {
        StreamState::Idle | StreamState::Open => (StreamState::HalfClosedRemote, false),
        StreamState::HalfClosedLocal => (StreamState::HalfClosedLocal, true),
        s => (s, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_directions_must_finish_before_settling() {
        let (state, settle) = advance_local(StreamState::Open);
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert!(!settle);

        let (state, settle) = advance_remote(state);
        assert_eq!(state, StreamState::HalfClosedLocal);
        assert!(settle);
    }

    #[test]
    fn order_of_finishes_does_not_matter() {
        let (state, settle) = advance_remote(StreamState::Open);
        assert_eq!(state, StreamState::HalfClosedRemote);
        assert!(!settle);

        let (_, settle) = advance_local(state);
        assert!(settle);
    }

    #[test]
    fn finishing_a_closed_stream_is_inert() {
        let (state, settle) = advance_local(StreamState::Closed);
        assert_eq!(state, StreamState::Closed);
        assert!(!settle);
        let (state, settle) = advance_remote(StreamState::Closed);
        assert_eq!(state, StreamState::Closed);
        assert!(!settle);
    }
}
