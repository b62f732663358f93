//! Per-peer state tracking.
//!
//! The remote client polls the same peers repeatedly while the cluster is
//! short of capacity. Logging every failed attempt would flood the log, so
//! the client logs only when a peer moves into a different state.

use std::collections::HashMap;
use std::fmt;

/// Last observed outcome of calling a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Answered with an accepted status, or never called.
    #[default]
    Available,
    /// Declined deliberately with a known-bad status.
    Declining,
    /// Unexpected status or transport failure.
    Failing,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerState::Available => "available",
            PeerState::Declining => "declining",
            PeerState::Failing => "failing",
        })
    }
}

/// Remembers the state of every peer URL the client has called.
#[derive(Debug, Default)]
pub struct PeerTracker {
    states: HashMap<String, PeerState>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a call. Returns the previous state when it
    /// differs from `state`, `None` otherwise.
    pub fn record(&mut self, peer: &str, state: PeerState) -> Option<PeerState> {
        let previous = self.states.insert(peer.to_string(), state).unwrap_or_default();
        (previous != state).then_some(previous)
    }

    pub fn state(&self, peer: &str) -> PeerState {
        self.states.get(peer).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: &str = "http://h1:8080/ingest";

    #[test]
    fn unknown_peer_is_available() {
        let tracker = PeerTracker::new();
        assert_eq!(tracker.state(PEER), PeerState::Available);
    }

    #[test]
    fn repeated_state_is_not_a_transition() {
        let mut tracker = PeerTracker::new();
        assert_eq!(tracker.record(PEER, PeerState::Declining), Some(PeerState::Available));
        assert_eq!(tracker.record(PEER, PeerState::Declining), None);
        assert_eq!(tracker.record(PEER, PeerState::Declining), None);
        assert_eq!(tracker.state(PEER), PeerState::Declining);
    }

    #[test]
    fn every_change_is_reported() {
        let mut tracker = PeerTracker::new();
        assert_eq!(tracker.record(PEER, PeerState::Available), None);
        assert_eq!(tracker.record(PEER, PeerState::Failing), Some(PeerState::Available));
        assert_eq!(tracker.record(PEER, PeerState::Declining), Some(PeerState::Failing));
        assert_eq!(tracker.record(PEER, PeerState::Available), Some(PeerState::Declining));
    }

    #[test]
    fn peers_are_tracked_independently() {
        let mut tracker = PeerTracker::new();
        tracker.record(PEER, PeerState::Failing);
        assert_eq!(tracker.state("http://h2:8080/ingest"), PeerState::Available);
    }
}
