use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::local::{LocalEndpoint, LocalEndpointError, LocalSink};
use crate::transport::{ChannelState, PeerTransport};

/// Why a pump stopped. Every exit is terminal for the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpExit {
    /// The remote→local queue could not be delivered.
    LocalUnavailable,
    /// The local endpoint ended its stream.
    LocalClosed,
    /// Sending on the data channel failed.
    RemoteSendFailed,
}

impl fmt::Display for PumpExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PumpExit::LocalUnavailable => "local endpoint unavailable",
            PumpExit::LocalClosed => "local endpoint closed",
            PumpExit::RemoteSendFailed => "data channel send failed",
        };
        f.write_str(label)
    }
}

/// The two forwarding pumps of one session plus the local connection they
/// share.
pub struct Bridge {
    sink: Arc<LocalSink>,
    remote_to_local: JoinHandle<()>,
    local_to_remote: JoinHandle<()>,
}

impl Bridge {
    /// Starts both pumps. `queue` carries inbound data-channel messages in
    /// arrival order; `exits` receives one report per pump that stops on its
    /// own.
    pub fn start(
        session_id: &str,
        endpoint: LocalEndpoint,
        queue: mpsc::UnboundedReceiver<String>,
        transport: Arc<dyn PeerTransport>,
        exits: mpsc::UnboundedSender<PumpExit>,
    ) -> Self {
        let (sink, stream) = endpoint.split();
        let sink = Arc::new(sink);

        let remote_to_local = tokio::spawn(remote_to_local(
            session_id.to_string(),
            queue,
            sink.clone(),
            exits.clone(),
        ));
        let local_to_remote = tokio::spawn(local_to_remote(
            session_id.to_string(),
            stream,
            transport,
            exits,
        ));

        Self {
            sink,
            remote_to_local,
            local_to_remote,
        }
    }

    /// Stops both pumps and asks the local endpoint to close.
    pub fn close(self) -> Result<(), LocalEndpointError> {
        self.remote_to_local.abort();
        self.local_to_remote.abort();
        self.sink.close()
    }
}

async fn remote_to_local(
    session_id: String,
    mut queue: mpsc::UnboundedReceiver<String>,
    sink: Arc<LocalSink>,
    exits: mpsc::UnboundedSender<PumpExit>,
) {
    while let Some(message) = queue.recv().await {
        if !sink.is_open() {
            debug!(
                target: "relay_gateway::bridge",
                session_id = %session_id,
                "local endpoint closed; undelivered message discarded"
            );
            let _ = exits.send(PumpExit::LocalUnavailable);
            return;
        }
        trace!(
            target: "relay_gateway::bridge",
            session_id = %session_id,
            len = message.len(),
            "remote -> local"
        );
        if let Err(err) = sink.send(message) {
            warn!(
                target: "relay_gateway::bridge",
                session_id = %session_id,
                error = %err,
                "failed to forward to local endpoint"
            );
            let _ = exits.send(PumpExit::LocalUnavailable);
            return;
        }
    }
}

async fn local_to_remote(
    session_id: String,
    mut stream: mpsc::UnboundedReceiver<String>,
    transport: Arc<dyn PeerTransport>,
    exits: mpsc::UnboundedSender<PumpExit>,
) {
    while let Some(message) = stream.recv().await {
        let state = transport.channel_state();
        if state != ChannelState::Open {
            debug!(
                target: "relay_gateway::bridge",
                session_id = %session_id,
                ?state,
                len = message.len(),
                "data channel not open; dropping local message"
            );
            continue;
        }
        trace!(
            target: "relay_gateway::bridge",
            session_id = %session_id,
            len = message.len(),
            "local -> remote"
        );
        if let Err(err) = transport.send_text(&message).await {
            warn!(
                target: "relay_gateway::bridge",
                session_id = %session_id,
                error = %err,
                "failed to forward to data channel"
            );
            let _ = exits.send(PumpExit::RemoteSendFailed);
            return;
        }
    }
    let _ = exits.send(PumpExit::LocalClosed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFrame;
    use crate::transport::mock::MockTransport;

    struct Harness {
        bridge: Bridge,
        queue: mpsc::UnboundedSender<String>,
        local_out: mpsc::UnboundedReceiver<LocalFrame>,
        local_in: mpsc::UnboundedSender<String>,
        exits: mpsc::UnboundedReceiver<PumpExit>,
        transport: Arc<MockTransport>,
    }

    fn harness() -> Harness {
        let (transport, _events) = MockTransport::new();
        let (out_tx, local_out) = mpsc::unbounded_channel();
        let (local_in, in_rx) = mpsc::unbounded_channel();
        let (queue, queue_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let bridge = Bridge::start(
            "s1",
            LocalEndpoint::new(out_tx, in_rx),
            queue_rx,
            transport.clone() as Arc<dyn PeerTransport>,
            exits_tx,
        );
        Harness {
            bridge,
            queue,
            local_out,
            local_in,
            exits,
            transport,
        }
    }

    #[tokio::test]
    async fn inbound_messages_reach_local_in_order() {
        let mut h = harness();
        for message in ["m1", "m2", "m3"] {
            h.queue.send(message.to_string()).expect("queue");
        }
        let mut delivered = Vec::new();
        for _ in 0..3 {
            match h.local_out.recv().await {
                Some(LocalFrame::Text(text)) => delivered.push(text),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(delivered, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn local_messages_are_dropped_until_channel_opens() {
        let mut h = harness();
        h.local_in.send("early".into()).expect("local");
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        h.transport.set_channel_state(ChannelState::Open);
        h.local_in.send("ping".into()).expect("local");
        h.transport.wait_until(|t| !t.sent().is_empty()).await;
        assert_eq!(h.transport.sent(), vec!["ping".to_string()]);
        assert!(h.exits.try_recv().is_err());
    }

    #[tokio::test]
    async fn local_stream_end_is_reported() {
        let mut h = harness();
        drop(h.local_in);
        assert_eq!(h.exits.recv().await, Some(PumpExit::LocalClosed));
    }

    #[tokio::test]
    async fn send_failure_is_terminal() {
        let mut h = harness();
        h.transport.set_channel_state(ChannelState::Open);
        h.transport.fail_sends();
        h.local_in.send("ping".into()).expect("local");
        assert_eq!(h.exits.recv().await, Some(PumpExit::RemoteSendFailed));
    }

    #[tokio::test]
    async fn closed_local_endpoint_stops_delivery() {
        let mut h = harness();
        drop(h.local_out);
        h.queue.send("m1".into()).expect("queue");
        assert_eq!(h.exits.recv().await, Some(PumpExit::LocalUnavailable));
    }

    #[tokio::test]
    async fn close_sends_close_frame() {
        let mut h = harness();
        h.bridge.close().expect("close");
        assert_eq!(h.local_out.recv().await, Some(LocalFrame::Close));
    }
}
