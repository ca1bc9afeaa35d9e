use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::{
    ChannelState, ConnectionState, IceCandidate, PeerTransport, SessionDescription,
    TransportError, TransportEvent, TransportEvents, TransportFactory,
};
use crate::config::IceServerConfig;

#[derive(Default)]
struct Recorded {
    remote_description: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    sent: Vec<String>,
    channel_closes: usize,
    closes: usize,
}

/// In-memory transport driven by the test. Events are injected with
/// [`MockTransport::emit`]; everything the gateway does to it is recorded.
pub struct MockTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    channel: Mutex<ChannelState>,
    recorded: Mutex<Recorded>,
    fail_answers: AtomicBool,
    fail_sends: AtomicBool,
    changed: Notify,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, TransportEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            events,
            channel: Mutex::new(ChannelState::Unavailable),
            recorded: Mutex::new(Recorded::default()),
            fail_answers: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            changed: Notify::new(),
        });
        (transport, rx)
    }

    /// Returns `false` once the consumer has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn open_channel(&self) -> bool {
        *self.channel.lock() = ChannelState::Open;
        self.emit(TransportEvent::ChannelOpen)
    }

    pub fn set_channel_state(&self, state: ChannelState) {
        *self.channel.lock() = state;
    }

    pub fn fail_answers(&self) {
        self.fail_answers.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().remote_description.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.recorded.lock().candidates.clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.recorded.lock().sent.clone()
    }

    pub fn channel_close_count(&self) -> usize {
        self.recorded.lock().channel_closes
    }

    pub fn close_count(&self) -> usize {
        self.recorded.lock().closes
    }

    /// Waits until `predicate` holds for the recorded state.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&MockTransport) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            if predicate(self) {
                return;
            }
            notified.await;
        }
    }

    fn record<R>(&self, apply: impl FnOnce(&mut Recorded) -> R) -> R {
        let result = apply(&mut self.recorded.lock());
        self.changed.notify_waiters();
        result
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if description.kind != "offer" {
            return Err(TransportError::InvalidDescription(format!(
                "expected offer, got {}",
                description.kind
            )));
        }
        self.record(|state| state.remote_description = Some(description));
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let remote = self.recorded.lock().remote_description.clone();
        let Some(remote) = remote else {
            return Err(TransportError::MissingRemoteDescription);
        };
        if self.fail_answers.load(Ordering::SeqCst) {
            return Err(TransportError::Operation("answer generation failed".into()));
        }
        Ok(SessionDescription::new(
            "answer",
            format!("v=0 answer to {}", remote.sdp.len()),
        ))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.record(|state| state.local_description = Some(description));
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.recorded.lock().local_description.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.record(|state| state.candidates.push(candidate));
        Ok(())
    }

    fn channel_state(&self) -> ChannelState {
        *self.channel.lock()
    }

    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.channel_state() != ChannelState::Open {
            return Err(TransportError::ChannelUnavailable);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Operation("send failed".into()));
        }
        self.record(|state| state.sent.push(text.to_string()));
        Ok(())
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        let was_open = {
            let mut channel = self.channel.lock();
            let was_open = matches!(*channel, ChannelState::Open | ChannelState::Connecting);
            *channel = ChannelState::Closed;
            was_open
        };
        self.record(|state| state.channel_closes += 1);
        if was_open {
            self.emit(TransportEvent::ChannelClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        *self.channel.lock() = ChannelState::Closed;
        self.record(|state| state.closes += 1);
        self.emit(TransportEvent::ConnectionState(ConnectionState::Closed));
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps them for later inspection.
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<(String, Arc<MockTransport>)>>,
    ice_servers: Mutex<Vec<IceServerConfig>>,
    fail_next: AtomicBool,
    changed: Notify,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recent transport created for `session_id`.
    pub fn transport(&self, session_id: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, transport)| transport.clone())
    }

    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        self.ice_servers.lock().clone()
    }

    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.created_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        session_id: &str,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Setup("mock factory refused".into()));
        }
        let (transport, events) = MockTransport::new();
        *self.ice_servers.lock() = ice_servers.to_vec();
        self.created
            .lock()
            .push((session_id.to_string(), transport.clone()));
        self.changed.notify_waiters();
        Ok((transport as Arc<dyn PeerTransport>, events))
    }
}
