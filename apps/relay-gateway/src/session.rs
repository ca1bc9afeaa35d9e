use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::transport::{PeerTransport, SessionDescription, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    New,
    HasRemoteDescription,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandshakeState::New => "new",
            HandshakeState::HasRemoteDescription => "has-remote-description",
            HandshakeState::AnswerSent => "answer-sent",
            HandshakeState::Connected => "connected",
            HandshakeState::Failed => "failed",
            HandshakeState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Where the local side of the bridge stands.
enum BridgeSlot {
    Pending,
    Active(Bridge),
    Abandoned,
    Released,
}

/// State of one remote client. The transport is owned exclusively; the
/// local endpoint and its pumps appear once the data channel opens.
pub struct Session {
    id: String,
    transport: Arc<dyn PeerTransport>,
    handshake: Mutex<HandshakeState>,
    queue_tx: mpsc::UnboundedSender<String>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    bridge: Mutex<BridgeSlot>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            id: id.into(),
            transport,
            handshake: Mutex::new(HandshakeState::New),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            bridge: Mutex::new(BridgeSlot::Pending),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.handshake.lock()
    }

    pub(crate) fn set_handshake_state(&self, state: HandshakeState) {
        let mut guard = self.handshake.lock();
        if matches!(*guard, HandshakeState::Closed) {
            return;
        }
        debug!(
            target: "relay_gateway::session",
            session_id = %self.id,
            from = %*guard,
            to = %state,
            "handshake state"
        );
        *guard = state;
    }

    /// Applies a remote offer and produces the local answer. Only one offer
    /// is accepted per session; later offers are rejected without touching
    /// the transport.
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        {
            let mut guard = self.handshake.lock();
            if *guard != HandshakeState::New {
                return Err(TransportError::Operation(format!(
                    "offer rejected in state {}",
                    *guard
                )));
            }
            // Claim the slot before awaiting so a concurrent offer cannot
            // slip past the check.
            *guard = HandshakeState::HasRemoteDescription;
        }

        if let Err(err) = self.transport.set_remote_description(offer).await {
            self.set_handshake_state(HandshakeState::Failed);
            return Err(err);
        }
        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                self.set_handshake_state(HandshakeState::Failed);
                return Err(err);
            }
        };
        if let Err(err) = self.transport.set_local_description(answer.clone()).await {
            self.set_handshake_state(HandshakeState::Failed);
            return Err(err);
        }
        Ok(self.transport.local_description().await.unwrap_or(answer))
    }

    /// Appends an inbound data-channel message to the delivery queue.
    /// Returns `false` when local setup was abandoned and nothing will ever
    /// drain the queue.
    pub fn enqueue(&self, message: String) -> bool {
        if matches!(
            *self.bridge.lock(),
            BridgeSlot::Abandoned | BridgeSlot::Released
        ) {
            return false;
        }
        self.queue_tx.send(message).is_ok()
    }

    pub fn bridge_pending(&self) -> bool {
        matches!(*self.bridge.lock(), BridgeSlot::Pending)
    }

    pub(crate) fn take_queue(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.queue_rx.lock().take()
    }

    /// Installs the running bridge. Hands it back if the session has
    /// already moved past the pending state.
    pub(crate) fn attach_bridge(&self, bridge: Bridge) -> Result<(), Bridge> {
        let mut slot = self.bridge.lock();
        if !matches!(*slot, BridgeSlot::Pending) {
            return Err(bridge);
        }
        *slot = BridgeSlot::Active(bridge);
        Ok(())
    }

    pub(crate) fn abandon_bridge(&self) {
        let mut slot = self.bridge.lock();
        if matches!(*slot, BridgeSlot::Pending) {
            *slot = BridgeSlot::Abandoned;
        }
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Releases every resource the session holds. Each step runs even if
    /// an earlier one fails. Callers first win
    /// [`SessionRegistry::remove_if_current`] or take the session out of
    /// [`SessionRegistry::drain`], which makes this run at most once.
    pub(crate) async fn release(&self) {
        info!(target: "relay_gateway::session", session_id = %self.id, "closing session");
        self.set_handshake_state(HandshakeState::Closed);
        self.shutdown.send_replace(true);

        let slot = std::mem::replace(&mut *self.bridge.lock(), BridgeSlot::Released);
        if let BridgeSlot::Active(bridge) = slot {
            if let Err(err) = bridge.close() {
                warn!(
                    target: "relay_gateway::session",
                    session_id = %self.id,
                    error = %err,
                    "failed to close local endpoint"
                );
            }
        }

        if let Err(err) = self.transport.close_channel().await {
            warn!(
                target: "relay_gateway::session",
                session_id = %self.id,
                error = %err,
                "failed to close data channel"
            );
        }
        if let Err(err) = self.transport.close().await {
            warn!(
                target: "relay_gateway::session",
                session_id = %self.id,
                error = %err,
                "failed to close transport"
            );
        }
    }
}

/// Sole authority on which sessions are active. All mutations happen under
/// one lock, so removal doubles as the single-winner teardown gate.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts unless the id is taken, in which case the rejected session
    /// is handed back.
    pub fn insert(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(session.id()) {
            return Err(session);
        }
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Removes the entry only if it is still the given session, so a stale
    /// trigger cannot evict a newer session that reused the id.
    pub fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().drain().map(|(_, session)| session).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn session(id: &str) -> (Arc<Session>, Arc<MockTransport>) {
        let (transport, _events) = MockTransport::new();
        let session = Arc::new(Session::new(id, transport.clone() as Arc<dyn PeerTransport>));
        (session, transport)
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let registry = SessionRegistry::new();
        let (first, _) = session("s1");
        let (second, _) = session("s1");
        assert!(registry.insert(first.clone()).is_ok());
        let rejected = registry.insert(second.clone()).expect_err("duplicate");
        assert!(Arc::ptr_eq(&rejected, &second));
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get("s1").expect("present"), &first));
    }

    #[test]
    fn connect_disconnect_sequences_leave_one_entry_per_id() {
        let registry = SessionRegistry::new();
        let script = [
            ("a", true),
            ("b", true),
            ("a", true),
            ("a", false),
            ("b", true),
            ("a", false),
            ("a", true),
            ("b", false),
        ];
        for (id, connect) in script {
            if connect {
                let (candidate, _) = session(id);
                let _ = registry.insert(candidate);
            } else if let Some(current) = registry.get(id) {
                assert!(registry.remove_if_current(&current));
                assert!(!registry.contains(id));
            }
            let ids = registry.ids();
            let mut deduped = ids.clone();
            deduped.dedup();
            assert_eq!(ids, deduped);
        }
        assert_eq!(registry.ids(), vec!["a".to_string()]);
    }

    #[test]
    fn stale_removal_keeps_the_newer_session() {
        let registry = SessionRegistry::new();
        let (old, _) = session("s1");
        let (new, _) = session("s1");
        assert!(registry.insert(old.clone()).is_ok());
        assert!(registry.remove_if_current(&old));
        assert!(registry.insert(new.clone()).is_ok());
        assert!(!registry.remove_if_current(&old));
        assert!(registry.contains("s1"));
    }

    #[tokio::test]
    async fn offer_produces_a_single_answer() {
        let (session, transport) = session("s1");
        let answer = session
            .accept_offer(SessionDescription::new("offer", "v=0 remote"))
            .await
            .expect("answer");
        assert_eq!(answer.kind, "answer");
        assert_eq!(
            transport.remote_description(),
            Some(SessionDescription::new("offer", "v=0 remote"))
        );
        assert_eq!(session.handshake_state(), HandshakeState::HasRemoteDescription);

        let second = session
            .accept_offer(SessionDescription::new("offer", "v=0 again"))
            .await;
        assert!(second.is_err());
        assert_eq!(
            transport.remote_description(),
            Some(SessionDescription::new("offer", "v=0 remote"))
        );
    }

    #[tokio::test]
    async fn failed_offer_marks_handshake_failed() {
        let (session, transport) = session("s1");
        transport.fail_answers();
        assert!(session
            .accept_offer(SessionDescription::new("offer", "v=0"))
            .await
            .is_err());
        assert_eq!(session.handshake_state(), HandshakeState::Failed);
    }

    #[tokio::test]
    async fn release_closes_channel_and_transport() {
        let (session, transport) = session("s1");
        let mut shutdown = session.subscribe_shutdown();
        session.release().await;
        assert_eq!(transport.channel_close_count(), 1);
        assert_eq!(transport.close_count(), 1);
        assert_eq!(session.handshake_state(), HandshakeState::Closed);
        assert!(shutdown.has_changed().unwrap_or(true));
        assert!(*shutdown.borrow_and_update());
        assert!(!session.enqueue("late".into()));
    }
}
