//! Tunnel agent state machine
//!
//! The agent owns the control-channel session, the connection table and the
//! bridge connector. Session events and bridge events are both handled on a
//! single dispatch loop, so the table has exactly one writer.
//!
//! # Lifecycle of a virtual connection
//!
//! `create_connection` inserts an entry in `Connecting` and starts a bridge.
//! The bridge reports `Opened` (entry becomes `Open`) or `OpenFailed` (an
//! `_error` goes upstream and the entry is removed). The entry leaves the
//! table when the proxy sends `_end`/`socket_error`, when the local target
//! closes (a `disconnect_client` goes upstream), or when the control channel
//! drops. Events for ids that are no longer tracked, and events from a
//! bridge that has since been replaced, are ignored.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rv_core::TunnelError;
use rv_protocol::{Event, SocketId};

use crate::bridge::{BridgeEvent, BridgeReport, LocalBridge};
use crate::connection::VirtualConnection;
use crate::table::ConnectionTable;
use crate::tunnel::{SessionEvent, TunnelSession};

/// Capacity of the channel carrying bridge events into the dispatch loop.
///
/// Bridge tasks await on it, so a busy agent slows down local reads instead
/// of buffering without bound.
const BRIDGE_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bridges remote virtual connections onto local sockets
pub struct TunnelAgent<S, B> {
    /// Identity announced in `register_server`
    hostname: String,
    session: S,
    bridge: B,
    table: ConnectionTable,
    /// Whether `register_server` has been sent on the current transport
    connected: bool,
    /// Stamp for the next bridge opened
    next_stamp: u64,
    bridge_tx: mpsc::Sender<BridgeReport>,
    bridge_rx: mpsc::Receiver<BridgeReport>,
}

impl<S, B> TunnelAgent<S, B>
where
    S: TunnelSession,
    B: LocalBridge,
{
    /// Create an agent. Nothing happens until [`run`](Self::run).
    pub fn new(hostname: impl Into<String>, session: S, bridge: B) -> Self {
        let (bridge_tx, bridge_rx) = mpsc::channel(BRIDGE_EVENT_CHANNEL_CAPACITY);
        Self {
            hostname: hostname.into(),
            session,
            bridge,
            table: ConnectionTable::new(),
            connected: false,
            next_stamp: 0,
            bridge_tx,
            bridge_rx,
        }
    }

    /// Identity announced to the proxy
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Live virtual connections
    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    /// Whether the agent has registered on the current transport
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connect the session and dispatch events until `shutdown` fires or the
    /// session stops
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.session.connect();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Tunnel agent for {} shutting down", self.hostname);
                    break;
                }

                event = self.session.next_event() => {
                    match event {
                        Some(event) => self.handle_session_event(event),
                        None => {
                            tracing::info!("Tunnel session ended");
                            break;
                        }
                    }
                }

                Some(report) = self.bridge_rx.recv() => {
                    self.handle_bridge_event(report);
                }
            }
        }

        self.close_all();
        self.session.shutdown();
    }

    /// Handle one event from the control-channel session
    pub fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => self.on_connected(),
            SessionEvent::Disconnected => self.on_disconnected(),
            SessionEvent::TransportError(reason) => {
                tracing::warn!("Control channel error: {}", reason);
                self.on_disconnected();
            }
            SessionEvent::Event(event) => self.handle_tunnel_event(event),
        }
    }

    /// Handle one event from a local bridge.
    ///
    /// Events from a bridge that no longer backs the table entry for its id
    /// (closed, or replaced by a later connection reusing the id) are ignored.
    pub fn handle_bridge_event(&mut self, report: BridgeReport) {
        let BridgeReport { stamp, event } = report;
        if !self.table.is_current(event.socket_id(), stamp) {
            self.ignore(TunnelError::UnknownId(event.socket_id().to_string()));
            return;
        }

        match event {
            BridgeEvent::Opened { socket_id } => {
                if let Some(connection) = self.table.get_mut(&socket_id) {
                    connection.mark_open();
                    tracing::debug!("Virtual connection {} open", socket_id);
                }
            }

            BridgeEvent::OpenFailed { socket_id, error } => {
                if let Some(mut connection) = self.table.remove(&socket_id) {
                    tracing::info!("Virtual connection {} failed to open: {}", socket_id, error);
                    connection.mark_closed();
                    self.session.send(Event::Error {
                        socket_id,
                        error: error.to_string(),
                    });
                }
            }

            BridgeEvent::Data { socket_id, payload } => {
                tracing::trace!("Relaying {} bytes for {}", payload.len(), socket_id);
                self.session.send(Event::Data { socket_id, payload });
            }

            BridgeEvent::Error { socket_id, error } => {
                // Removal waits for the Closed that follows
                tracing::debug!("Virtual connection {} local error: {}", socket_id, error);
                self.session.send(Event::Error {
                    socket_id,
                    error: error.to_string(),
                });
            }

            BridgeEvent::Closed { socket_id } => {
                if let Some(mut connection) = self.table.remove(&socket_id) {
                    tracing::debug!("Local target closed {}", socket_id);
                    connection.mark_closed();
                    self.session.send(Event::DisconnectClient { socket_id });
                }
            }
        }
    }

    fn handle_tunnel_event(&mut self, event: Event) {
        match event {
            Event::CreateConnection { socket_id } => self.on_create(socket_id),
            Event::Data { socket_id, payload } => self.on_data(socket_id, payload),
            Event::End { socket_id } | Event::SocketError { socket_id } => self.on_end(socket_id),
            other => {
                tracing::warn!("Unexpected {} event from proxy", other.name());
            }
        }
    }

    fn on_connected(&mut self) {
        if self.connected {
            tracing::debug!("Ignoring duplicate connect");
            return;
        }

        self.connected = true;
        tracing::info!("Registering {} with rendezvous proxy", self.hostname);
        self.session.send(Event::RegisterServer {
            hostname: self.hostname.clone(),
        });
    }

    fn on_disconnected(&mut self) {
        if self.connected || !self.table.is_empty() {
            tracing::info!(
                "{}; closing {} virtual connections",
                TunnelError::TransportDisconnected,
                self.table.len()
            );
        }
        self.connected = false;
        self.close_all();
    }

    fn on_create(&mut self, socket_id: SocketId) {
        if self.table.contains(&socket_id) {
            self.ignore(TunnelError::DuplicateCreate(socket_id.to_string()));
            return;
        }

        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);

        tracing::debug!("Creating virtual connection {} (bridge {})", socket_id, stamp);
        let bridge = self.bridge.open(socket_id.clone(), stamp, self.bridge_tx.clone());
        self.table.insert(VirtualConnection::new(socket_id, stamp, bridge));
    }

    fn on_data(&mut self, socket_id: SocketId, payload: Bytes) {
        match self.table.get(&socket_id) {
            Some(connection) if connection.accepts_data() => {
                tracing::trace!("Writing {} bytes to {}", payload.len(), socket_id);
                connection.write(payload);
            }
            _ => self.ignore(TunnelError::UnknownId(socket_id.to_string())),
        }
    }

    fn on_end(&mut self, socket_id: SocketId) {
        match self.table.remove(&socket_id) {
            Some(mut connection) => {
                tracing::debug!("Proxy ended {}", socket_id);
                connection.close();
            }
            None => self.ignore(TunnelError::UnknownId(socket_id.to_string())),
        }
    }

    fn close_all(&mut self) {
        for mut connection in self.table.drain() {
            connection.close();
        }
    }

    fn ignore(&self, reason: TunnelError) {
        tracing::trace!("Ignoring: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use async_trait::async_trait;
    use rv_core::ConnectionState;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// Session that records everything sent through it
    #[derive(Default)]
    struct RecordingSession {
        sent: Arc<Mutex<Vec<Event>>>,
        events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
        connects: usize,
    }

    #[async_trait]
    impl TunnelSession for RecordingSession {
        fn connect(&mut self) {
            self.connects += 1;
        }

        fn send(&self, event: Event) {
            self.sent.lock().unwrap().push(event);
        }

        async fn next_event(&mut self) -> Option<SessionEvent> {
            match self.events.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            }
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn shutdown(&mut self) {}
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Open(SocketId),
        Write(SocketId, Bytes),
        Close(SocketId),
    }

    /// Bridge connector that records calls instead of touching sockets
    #[derive(Clone, Default)]
    struct RecordingBridge {
        calls: Arc<Mutex<Vec<Call>>>,
        /// Latest stamp handed out per id
        stamps: Arc<Mutex<HashMap<SocketId, u64>>>,
    }

    struct RecordingHandle {
        id: SocketId,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl Bridge for RecordingHandle {
        fn write(&self, payload: Bytes) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Write(self.id.clone(), payload));
        }

        fn close(&self) {
            self.calls.lock().unwrap().push(Call::Close(self.id.clone()));
        }
    }

    impl LocalBridge for RecordingBridge {
        fn open(
            &self,
            socket_id: SocketId,
            stamp: u64,
            _events: mpsc::Sender<BridgeReport>,
        ) -> Box<dyn Bridge> {
            self.calls.lock().unwrap().push(Call::Open(socket_id.clone()));
            self.stamps.lock().unwrap().insert(socket_id.clone(), stamp);
            Box::new(RecordingHandle {
                id: socket_id,
                calls: Arc::clone(&self.calls),
            })
        }
    }

    impl RecordingBridge {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, wanted: impl Fn(&Call) -> bool) -> usize {
            self.calls().iter().filter(|c| wanted(c)).count()
        }

        fn stamp_of(&self, id: &SocketId) -> u64 {
            self.stamps.lock().unwrap()[id]
        }
    }

    type TestAgent = TunnelAgent<RecordingSession, RecordingBridge>;

    fn agent() -> (TestAgent, Arc<Mutex<Vec<Event>>>, RecordingBridge) {
        let session = RecordingSession::default();
        let sent = Arc::clone(&session.sent);
        let bridge = RecordingBridge::default();
        let agent = TunnelAgent::new("a1.edge.example.net", session, bridge.clone());
        (agent, sent, bridge)
    }

    fn id(s: &str) -> SocketId {
        SocketId::from(s)
    }

    fn inbound(agent: &mut TestAgent, event: Event) {
        agent.handle_session_event(SessionEvent::Event(event));
    }

    fn create(agent: &mut TestAgent, s: &str) {
        inbound(agent, Event::CreateConnection { socket_id: id(s) });
    }

    fn data(agent: &mut TestAgent, s: &str, payload: &'static [u8]) {
        inbound(
            agent,
            Event::Data {
                socket_id: id(s),
                payload: Bytes::from_static(payload),
            },
        );
    }

    /// Deliver `event` as if raised by the latest bridge opened for its id
    fn local(agent: &mut TestAgent, bridge: &RecordingBridge, event: BridgeEvent) {
        let stamp = bridge.stamp_of(event.socket_id());
        agent.handle_bridge_event(BridgeReport { stamp, event });
    }

    fn opened(agent: &mut TestAgent, bridge: &RecordingBridge, s: &str) {
        local(agent, bridge, BridgeEvent::Opened { socket_id: id(s) });
    }

    #[test]
    fn test_connect_registers_once() {
        let (mut agent, sent, _) = agent();

        agent.handle_session_event(SessionEvent::Connected);
        agent.handle_session_event(SessionEvent::Connected);

        assert!(agent.is_connected());
        assert_eq!(
            *sent.lock().unwrap(),
            vec![Event::RegisterServer {
                hostname: "a1.edge.example.net".to_string()
            }]
        );
    }

    #[test]
    fn test_reconnect_registers_again() {
        let (mut agent, sent, _) = agent();

        agent.handle_session_event(SessionEvent::Connected);
        agent.handle_session_event(SessionEvent::Disconnected);
        assert!(!agent.is_connected());
        agent.handle_session_event(SessionEvent::Connected);

        let registers = sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::RegisterServer { .. }))
            .count();
        assert_eq!(registers, 2);
    }

    #[test]
    fn test_create_then_end_closes_once() {
        let (mut agent, _, bridge) = agent();

        create(&mut agent, "s1");
        opened(&mut agent, &bridge, "s1");
        assert_eq!(
            agent.table().get(&id("s1")).unwrap().state(),
            ConnectionState::Open
        );

        inbound(&mut agent, Event::End { socket_id: id("s1") });
        inbound(&mut agent, Event::End { socket_id: id("s1") });

        assert!(!agent.table().contains(&id("s1")));
        assert_eq!(bridge.count(|c| *c == Call::Close(id("s1"))), 1);
    }

    #[test]
    fn test_end_while_connecting() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "s1");
        inbound(&mut agent, Event::End { socket_id: id("s1") });
        // Bridge reported open just before it saw the close
        opened(&mut agent, &bridge, "s1");

        assert!(agent.table().is_empty());
        assert_eq!(bridge.count(|c| matches!(c, Call::Close(_))), 1);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_socket_error_from_proxy_tears_down() {
        let (mut agent, _, bridge) = agent();

        create(&mut agent, "s1");
        opened(&mut agent, &bridge, "s1");
        inbound(&mut agent, Event::SocketError { socket_id: id("s1") });

        assert!(agent.table().is_empty());
        assert_eq!(bridge.count(|c| *c == Call::Close(id("s1"))), 1);
    }

    #[test]
    fn test_duplicate_create_opens_once() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "dup");
        opened(&mut agent, &bridge, "dup");
        create(&mut agent, "dup");

        assert_eq!(bridge.count(|c| matches!(c, Call::Open(_))), 1);
        assert_eq!(agent.table().len(), 1);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_data_for_unknown_id_is_ignored() {
        let (mut agent, sent, bridge) = agent();

        data(&mut agent, "never", b"hello");
        create(&mut agent, "gone");
        inbound(&mut agent, Event::End { socket_id: id("gone") });
        data(&mut agent, "gone", b"late");

        assert_eq!(bridge.count(|c| matches!(c, Call::Write(..))), 0);
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_data_while_connecting_is_forwarded() {
        let (mut agent, _, bridge) = agent();

        create(&mut agent, "s1");
        data(&mut agent, "s1", b"GET / HTTP/1.1\r\n\r\n");

        assert_eq!(
            bridge.calls(),
            vec![
                Call::Open(id("s1")),
                Call::Write(id("s1"), Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")),
            ]
        );
    }

    #[test]
    fn test_disconnect_closes_everything() {
        let (mut agent, _, bridge) = agent();

        // Empty table
        agent.handle_session_event(SessionEvent::Connected);
        agent.handle_session_event(SessionEvent::Disconnected);
        assert!(agent.table().is_empty());

        agent.handle_session_event(SessionEvent::Connected);
        for s in ["a", "b", "c", "d"] {
            create(&mut agent, s);
        }
        opened(&mut agent, &bridge, "a");
        opened(&mut agent, &bridge, "c");

        agent.handle_session_event(SessionEvent::Disconnected);

        assert!(agent.table().is_empty());
        assert!(!agent.is_connected());
        for s in ["a", "b", "c", "d"] {
            assert_eq!(bridge.count(|c| *c == Call::Close(id(s))), 1, "id {}", s);
        }
    }

    #[test]
    fn test_transport_error_cleans_up_like_disconnect() {
        let (mut agent, _, bridge) = agent();

        agent.handle_session_event(SessionEvent::Connected);
        create(&mut agent, "a");
        agent.handle_session_event(SessionEvent::TransportError("reset".into()));
        agent.handle_session_event(SessionEvent::Disconnected);

        assert!(agent.table().is_empty());
        assert_eq!(bridge.count(|c| *c == Call::Close(id("a"))), 1);
    }

    #[test]
    fn test_local_data_relayed_with_same_id() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "r1");
        opened(&mut agent, &bridge, "r1");
        local(
            &mut agent,
            &bridge,
            BridgeEvent::Data {
                socket_id: id("r1"),
                payload: Bytes::from_static(b"\x00\xffpayload"),
            },
        );

        assert_eq!(
            *sent.lock().unwrap(),
            vec![Event::Data {
                socket_id: id("r1"),
                payload: Bytes::from_static(b"\x00\xffpayload"),
            }]
        );
    }

    #[test]
    fn test_interleaved_writes_keep_per_id_order() {
        let (mut agent, _, bridge) = agent();

        create(&mut agent, "A");
        create(&mut agent, "B");
        opened(&mut agent, &bridge, "B");
        data(&mut agent, "A", b"a1");
        data(&mut agent, "B", b"b1");
        data(&mut agent, "B", b"b2");
        opened(&mut agent, &bridge, "A");
        data(&mut agent, "A", b"a2");
        data(&mut agent, "B", b"b3");
        data(&mut agent, "A", b"a3");

        let writes_for = |s: &str| -> Vec<Bytes> {
            bridge
                .calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Write(who, payload) if who == id(s) => Some(payload),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(writes_for("A"), vec!["a1", "a2", "a3"]);
        assert_eq!(writes_for("B"), vec!["b1", "b2", "b3"]);
    }

    #[test]
    fn test_open_failure_reports_once_and_removes() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "x");
        local(
            &mut agent,
            &bridge,
            BridgeEvent::OpenFailed {
                socket_id: id("x"),
                error: TunnelError::TargetUnreachable("connection refused".into()),
            },
        );

        assert!(!agent.table().contains(&id("x")));
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Event::Error { socket_id, error }
            if *socket_id == id("x") && error.contains("connection refused")));
    }

    #[test]
    fn test_local_close_notifies_once() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "c1");
        opened(&mut agent, &bridge, "c1");
        local(&mut agent, &bridge, BridgeEvent::Closed { socket_id: id("c1") });
        local(&mut agent, &bridge, BridgeEvent::Closed { socket_id: id("c1") });
        data(&mut agent, "c1", b"late");

        assert!(agent.table().is_empty());
        assert_eq!(
            *sent.lock().unwrap(),
            vec![Event::DisconnectClient { socket_id: id("c1") }]
        );
        assert_eq!(bridge.count(|c| matches!(c, Call::Write(..))), 0);
    }

    #[test]
    fn test_local_error_waits_for_close() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "e1");
        opened(&mut agent, &bridge, "e1");
        local(
            &mut agent,
            &bridge,
            BridgeEvent::Error {
                socket_id: id("e1"),
                error: TunnelError::LocalSocketError("reset by peer".into()),
            },
        );

        assert!(agent.table().contains(&id("e1")));

        local(&mut agent, &bridge, BridgeEvent::Closed { socket_id: id("e1") });
        assert!(agent.table().is_empty());

        let sent = sent.lock().unwrap();
        assert!(matches!(&sent[0], Event::Error { socket_id, .. } if *socket_id == id("e1")));
        assert_eq!(sent[1], Event::DisconnectClient { socket_id: id("e1") });
    }

    #[test]
    fn test_stale_bridge_events_after_reconnect_are_ignored() {
        let (mut agent, sent, bridge) = agent();

        agent.handle_session_event(SessionEvent::Connected);
        create(&mut agent, "1");
        opened(&mut agent, &bridge, "1");
        let old = bridge.stamp_of(&id("1"));

        agent.handle_session_event(SessionEvent::Disconnected);
        agent.handle_session_event(SessionEvent::Connected);
        create(&mut agent, "1");
        opened(&mut agent, &bridge, "1");
        assert_ne!(bridge.stamp_of(&id("1")), old);

        // Still queued from the bridge torn down on disconnect
        agent.handle_bridge_event(BridgeReport {
            stamp: old,
            event: BridgeEvent::Data {
                socket_id: id("1"),
                payload: Bytes::from_static(b"old response"),
            },
        });
        agent.handle_bridge_event(BridgeReport {
            stamp: old,
            event: BridgeEvent::Closed { socket_id: id("1") },
        });

        assert_eq!(
            agent.table().get(&id("1")).unwrap().state(),
            ConnectionState::Open
        );
        assert!(sent
            .lock()
            .unwrap()
            .iter()
            .all(|e| matches!(e, Event::RegisterServer { .. })));
    }

    #[test]
    fn test_stale_open_failure_after_end_and_recreate_is_ignored() {
        let (mut agent, sent, bridge) = agent();

        create(&mut agent, "r");
        let old = bridge.stamp_of(&id("r"));
        inbound(&mut agent, Event::End { socket_id: id("r") });
        create(&mut agent, "r");

        agent.handle_bridge_event(BridgeReport {
            stamp: old,
            event: BridgeEvent::OpenFailed {
                socket_id: id("r"),
                error: TunnelError::TargetUnreachable("refused".into()),
            },
        });

        assert_eq!(
            agent.table().get(&id("r")).unwrap().state(),
            ConnectionState::Connecting
        );
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_dispatches_until_shutdown() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = RecordingSession {
            events: Some(events_rx),
            ..RecordingSession::default()
        };
        let sent = Arc::clone(&session.sent);
        let bridge = RecordingBridge::default();
        let agent = TunnelAgent::new("a1", session, bridge.clone());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        events_tx.send(SessionEvent::Connected).unwrap();
        events_tx
            .send(SessionEvent::Event(Event::CreateConnection { socket_id: id("s") }))
            .unwrap();

        // Wait for the create to be processed
        for _ in 0..100 {
            if bridge.count(|c| matches!(c, Call::Open(_))) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(sent.lock().unwrap().len(), 1);
        // Live connections are closed on shutdown
        assert_eq!(bridge.count(|c| *c == Call::Close(id("s"))), 1);
    }
}
