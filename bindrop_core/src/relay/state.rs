use crate::codes::CodeRegistry;
use crate::flow::FlowSender;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Longest peer identifier the relay accepts in Identify
pub const MAX_PEER_ID_LENGTH: usize = 128;

/// One connection as the relay sees it
pub struct PeerSession {
    pub id: u64,
    /// Empty until Identify
    pub peer_id: String,
    /// Empty until a code is assigned
    pub code: String,
    pub connected_at: Instant,
    /// Set once the session stream is open
    pub flow: Option<FlowSender>,
    /// Cancelling tears the session down
    pub kill: CancellationToken,
}

impl PeerSession {
    pub fn is_identified(&self) -> bool {
        !self.code.is_empty()
    }
}

/// Everything the relay knows about live connections. Owned by one relay
/// instance and passed in at construction.
#[derive(Default)]
pub struct RelayState {
    sessions: HashMap<u64, PeerSession>,
    codes: CodeRegistry,
    /// Transfers a drain task is currently handing out
    draining: HashSet<String>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: u64, kill: CancellationToken) {
        self.sessions.insert(
            id,
            PeerSession {
                id,
                peer_id: String::new(),
                code: String::new(),
                connected_at: Instant::now(),
                flow: None,
                kill,
            },
        );
    }

    pub fn attach_flow(&mut self, id: u64, flow: FlowSender) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.flow = Some(flow);
        }
    }

    /// Record the declared identifier and hand out a code. A session that
    /// identifies twice keeps its first code. Returns `None` for an
    /// unknown session or an unacceptable identifier.
    pub fn identify(&mut self, id: u64, peer_id: &str) -> Option<String> {
        if peer_id.is_empty() || peer_id.len() > MAX_PEER_ID_LENGTH {
            return None;
        }
        let session = self.sessions.get_mut(&id)?;
        if session.is_identified() {
            return Some(session.code.clone());
        }
        session.peer_id = peer_id.to_string();
        session.code = self.codes.assign();
        Some(session.code.clone())
    }

    pub fn get(&self, id: u64) -> Option<&PeerSession> {
        self.sessions.get(&id)
    }

    pub fn by_code(&self, code: &str) -> Option<&PeerSession> {
        if code.is_empty() || !self.codes.is_live(code) {
            return None;
        }
        self.sessions.values().find(|s| s.code == code)
    }

    pub fn by_peer_id(&self, peer_id: &str) -> Option<&PeerSession> {
        if peer_id.is_empty() {
            return None;
        }
        self.sessions
            .values()
            .find(|s| s.is_identified() && s.peer_id == peer_id)
    }

    /// Owner of `code` as seen by session `requester`. A session never
    /// resolves its own code.
    pub fn resolve_code(&self, requester: u64, code: &str) -> Option<&PeerSession> {
        self.by_code(code).filter(|s| s.id != requester)
    }

    /// Drop the session and free its code
    pub fn remove(&mut self, id: u64) -> Option<PeerSession> {
        let session = self.sessions.remove(&id)?;
        if session.is_identified() {
            self.codes.release(&session.code);
        }
        Some(session)
    }

    /// Sessions still unidentified after `timeout`
    pub fn overdue(&self, timeout: Duration) -> Vec<u64> {
        self.sessions
            .values()
            .filter(|s| !s.is_identified() && s.connected_at.elapsed() >= timeout)
            .map(|s| s.id)
            .collect()
    }

    /// Flow senders of every identified session except `exclude`
    pub fn identified_flows(&self, exclude: u64) -> Vec<FlowSender> {
        self.sessions
            .values()
            .filter(|s| s.id != exclude && s.is_identified())
            .filter_map(|s| s.flow.clone())
            .collect()
    }

    pub fn live_codes(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.is_identified())
            .map(|s| s.code.clone())
            .collect()
    }

    /// Claim `uids` for draining. Returns the ones not already claimed, in
    /// order; the rest are being drained by someone else.
    pub fn begin_drain(&mut self, uids: Vec<String>) -> Vec<String> {
        uids.into_iter()
            .filter(|uid| self.draining.insert(uid.clone()))
            .collect()
    }

    pub fn end_drain(&mut self, uid: &str) {
        self.draining.remove(uid);
    }

    pub fn is_draining(&self, uid: &str) -> bool {
        self.draining.contains(uid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn state_with(n: u64) -> RelayState {
        let mut state = RelayState::new();
        for id in 0..n {
            state.register(id, CancellationToken::new());
        }
        state
    }

    #[test]
    fn test_codes_distinct_across_sessions() {
        let mut state = state_with(200);
        let codes: HashSet<String> = (0..200)
            .map(|id| state.identify(id, &format!("peer{}", id)).unwrap())
            .collect();
        assert_eq!(codes.len(), 200);
    }

    #[test]
    fn test_identify_twice_keeps_code() {
        let mut state = state_with(1);
        let first = state.identify(0, "peer").unwrap();
        let second = state.identify(0, "other").unwrap();
        assert_eq!(first, second);
        assert_eq!(state.get(0).unwrap().peer_id, "peer");
    }

    #[test]
    fn test_bad_identifier_refused() {
        let mut state = state_with(1);
        assert!(state.identify(0, "").is_none());
        assert!(state.identify(0, &"x".repeat(MAX_PEER_ID_LENGTH + 1)).is_none());
        assert!(!state.get(0).unwrap().is_identified());
    }

    #[test]
    fn test_own_code_does_not_resolve() {
        let mut state = state_with(2);
        let a = state.identify(0, "alice").unwrap();
        state.identify(1, "bob").unwrap();

        assert!(state.resolve_code(0, &a).is_none());
        assert_eq!(state.resolve_code(1, &a).unwrap().peer_id, "alice");
        assert!(state.resolve_code(1, "????").is_none());
    }

    #[test]
    fn test_remove_frees_code() {
        let mut state = state_with(2);
        let a = state.identify(0, "alice").unwrap();
        let removed = state.remove(0).unwrap();
        assert_eq!(removed.code, a);
        assert!(state.by_code(&a).is_none());
        assert!(!state.live_codes().contains(&a));
        assert!(state.remove(0).is_none());
    }

    #[test]
    fn test_drain_claimed_once() {
        let mut state = RelayState::new();
        let ids = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(state.begin_drain(ids(&["f1", "f2"])), ids(&["f1", "f2"]));
        assert_eq!(state.begin_drain(ids(&["f2", "f3", "f3"])), ids(&["f3"]));
        assert!(state.is_draining("f1"));

        state.end_drain("f1");
        assert!(!state.is_draining("f1"));
        assert_eq!(state.begin_drain(ids(&["f1"])), ids(&["f1"]));
    }

    #[test]
    fn test_overdue_only_unidentified() {
        let mut state = state_with(2);
        state.identify(0, "alice").unwrap();
        let overdue = state.overdue(Duration::ZERO);
        assert_eq!(overdue, vec![1]);
        assert!(state.overdue(Duration::from_secs(3600)).is_empty());
    }
}
