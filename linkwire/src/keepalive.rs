//! Two-phase keepalive state machine: every 30s mark all clients as
//! awaiting an ack and probe them; 30s later, anything still awaiting is
//! considered unresponsive.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;

use crate::registry::ConnectionId;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(30);

/// Tracks which connections have not yet acknowledged the current round's
/// probe. Owns no I/O; the server drives sends/disconnects around it.
pub struct KeepaliveState {
    awaiting_ack: Mutex<HashSet<ConnectionId>>,
}

impl KeepaliveState {
    pub fn new() -> Self {
        KeepaliveState {
            awaiting_ack: Mutex::new(HashSet::new()),
        }
    }

    /// Mark every currently-connected id as awaiting an ack for this round.
    pub fn begin_round(&self, connected: impl IntoIterator<Item = ConnectionId>) {
        let mut awaiting = self.awaiting_ack.lock();
        awaiting.clear();
        awaiting.extend(connected);
    }

    /// Record that `id` acknowledged the current round's probe. Returns
    /// whether it had been awaiting one (a stray ack is otherwise ignored).
    pub fn acknowledge(&self, id: ConnectionId) -> bool {
        self.awaiting_ack.lock().remove(&id)
    }

    /// A connection disconnected or was removed independently of keepalive;
    /// stop tracking it so a later round doesn't try to probe it.
    pub fn forget(&self, id: ConnectionId) {
        self.awaiting_ack.lock().remove(&id);
    }

    /// End the round: return everyone who never acknowledged, and clear the
    /// set so the next round starts fresh.
    pub fn end_round(&self) -> Vec<ConnectionId> {
        std::mem::take(&mut *self.awaiting_ack.lock())
            .into_iter()
            .collect()
    }
}

impl Default for KeepaliveState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ConnectionId {
        // ConnectionId has no public constructor; tests exercise the state
        // machine through the generator, matching how the server obtains ids.
        let gen = crate::registry::ConnectionIdGenerator::new();
        for _ in 0..n {
            gen.next();
        }
        gen.next()
    }

    #[test]
    fn responsive_client_is_never_flagged_unresponsive() {
        let state = KeepaliveState::new();
        let a = id(0);
        state.begin_round([a]);
        assert!(state.acknowledge(a));
        assert_eq!(state.end_round(), Vec::new());
    }

    #[test]
    fn unresponsive_client_remains_after_round() {
        let state = KeepaliveState::new();
        let a = id(0);
        state.begin_round([a]);
        let unresponsive = state.end_round();
        assert_eq!(unresponsive, vec![a]);
    }

    #[test]
    fn forgetting_a_connection_excludes_it_from_the_round() {
        let state = KeepaliveState::new();
        let a = id(0);
        state.begin_round([a]);
        state.forget(a);
        assert_eq!(state.end_round(), Vec::new());
    }

    #[test]
    fn stray_ack_is_harmless() {
        let state = KeepaliveState::new();
        let a = id(0);
        assert!(!state.acknowledge(a));
    }
}
