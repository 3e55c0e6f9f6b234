//! Talk: the per-peer session actor.
//!
//! A [`Talk`] owns one [`SecureChannel`] and one [`Transport`] and runs three
//! pumps over bounded queues:
//!
//! - **receive**: transport frame -> `SecureChannel::receive` -> plaintext to
//!   the inbound queue, reply fragments to the ciphertext queue
//! - **outbound**: operator line -> `SecureChannel::send` -> fragments to the
//!   ciphertext queue
//! - **write**: ciphertext queue -> transport, in order; also sends a ping
//!   whenever the keepalive period passes with nothing written
//!
//! Channel calls are serialized by one async mutex that stays held while the
//! resulting fragments are queued, so the ciphertext queue always sees one
//! call's fragments contiguously and in the order they were produced.
//!
//! Any fatal condition raises the talk's `active` signal exactly once; every
//! pump races its blocking wait against it, the transport is closed, and a
//! [`ConnectEvent::Disconnected`] is emitted if the talk ever had a name.

use crate::address_book::AddressBook;
use crate::channel::{SecureChannel, SecurityEvent};
use crate::error::WireError;
use crate::transport::{Frame, FrameSink, FrameSource, Transport};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tulip_types::config::{DEFAULT_KEEPALIVE_SECS, DEFAULT_QUEUE_CAPACITY};
use tulip_types::{Fingerprint, TulipConfig};

static NEXT_TALK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique talk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TalkId(u64);

impl TalkId {
    fn next() -> Self {
        Self(NEXT_TALK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TalkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the talk came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TalkOrigin {
    /// Accepted on our listening endpoint.
    Inbound,
    /// Dialed by the operator.
    Outbound,
}

/// Session-wide notifications raised by talks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectEvent {
    /// A talk's channel changed security state; its events are waiting to be
    /// drained by the next reconciliation pass.
    SecurityChanged { talk: TalkId },
    /// A named talk ended.
    Disconnected { talk: TalkId, name: String },
    /// An outbound dial never produced a talk.
    DialFailed { address: String, error: String },
}

/// Queue sizes and timers for a talk.
#[derive(Debug, Clone)]
pub struct TalkConfig {
    /// Capacity of each bounded queue.
    pub queue_capacity: usize,
    /// Keepalive ping period.
    pub keepalive: Duration,
}

impl Default for TalkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
        }
    }
}

impl From<&TulipConfig> for TalkConfig {
    fn from(config: &TulipConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity.max(1),
            keepalive: Duration::from_secs(config.keepalive_secs.max(1)),
        }
    }
}

/// Resolves once `active` has been raised (or its sender is gone).
async fn cancelled(active: &mut watch::Receiver<bool>) {
    let _ = active.wait_for(|stopped| *stopped).await;
}

/// One peer conversation.
pub struct Talk {
    id: TalkId,
    origin: TalkOrigin,
    peer_addr: String,
    channel: Mutex<Box<dyn SecureChannel>>,
    outbound: mpsc::Sender<String>,
    pending: mpsc::Sender<String>,
    active: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    security: StdMutex<Vec<SecurityEvent>>,
    peer: StdMutex<Option<Fingerprint>>,
    last_known_name: StdMutex<String>,
    connect_events: mpsc::UnboundedSender<ConnectEvent>,
}

impl Talk {
    /// Start a talk over `transport`. Returns immediately with the talk and
    /// the receiver of its inbound plaintext queue.
    pub fn spawn(
        transport: Transport,
        channel: Box<dyn SecureChannel>,
        origin: TalkOrigin,
        config: &TalkConfig,
        connect_events: mpsc::UnboundedSender<ConnectEvent>,
    ) -> (Arc<Talk>, mpsc::Receiver<String>) {
        let capacity = config.queue_capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (pending_tx, pending_rx) = mpsc::channel(capacity);
        let (active, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let Transport { source, sink, peer } = transport;

        let talk = Arc::new(Talk {
            id: TalkId::next(),
            origin,
            peer_addr: peer,
            channel: Mutex::new(channel),
            outbound: outbound_tx,
            pending: pending_tx,
            active,
            closed,
            security: StdMutex::new(Vec::new()),
            peer: StdMutex::new(None),
            last_known_name: StdMutex::new(String::new()),
            connect_events,
        });

        info!(talk = %talk.id, peer = %talk.peer_addr, origin = ?origin, "Talk started");

        let receive = tokio::spawn(Arc::clone(&talk).receive_pump(source, inbound_tx));
        let outbound = tokio::spawn(Arc::clone(&talk).outbound_pump(outbound_rx));
        let write = tokio::spawn(Arc::clone(&talk).write_pump(sink, pending_rx, config.keepalive));

        let supervisor = Arc::clone(&talk);
        tokio::spawn(async move {
            let _ = tokio::join!(receive, outbound, write);
            supervisor.terminate();
            let name = supervisor.last_known_name();
            info!(talk = %supervisor.id, name = %name, "Closed connection");
            if !name.is_empty() {
                let _ = supervisor.connect_events.send(ConnectEvent::Disconnected {
                    talk: supervisor.id,
                    name,
                });
            }
            supervisor.closed.send_replace(true);
        });

        (talk, inbound_rx)
    }

    pub fn id(&self) -> TalkId {
        self.id
    }

    pub fn origin(&self) -> TalkOrigin {
        self.origin
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Whether the talk is still running.
    pub fn is_active(&self) -> bool {
        !*self.active.borrow()
    }

    /// Raise the cancellation signal. Idempotent.
    pub fn terminate(&self) {
        if !self.active.send_replace(true) {
            debug!(talk = %self.id, "Talk terminating");
        }
    }

    /// Wait until all pumps have stopped and the transport is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Queue a plaintext line for encryption and delivery.
    pub async fn send(&self, line: impl Into<String>) -> Result<(), WireError> {
        if !self.is_active() {
            return Err(WireError::TalkClosed(self.id.to_string()));
        }
        self.outbound
            .send(line.into())
            .await
            .map_err(|_| WireError::TalkClosed(self.id.to_string()))
    }

    /// The peer's identity, known once the channel has gone secure.
    pub fn peer_identity(&self) -> Option<Fingerprint> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Display name for the peer: its address-book alias, otherwise the hex
    /// fingerprint, or empty while the identity is unknown. A non-empty
    /// result is cached as the talk's last known name.
    pub fn best_name(&self, book: &AddressBook) -> String {
        let Some(fingerprint) = self.peer_identity() else {
            return String::new();
        };
        let name = book
            .lookup_fingerprint(&fingerprint)
            .map(str::to_string)
            .unwrap_or_else(|| fingerprint.to_hex());
        *self
            .last_known_name
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = name.clone();
        name
    }

    /// Cached display name from the last [`best_name`](Self::best_name) call.
    pub fn last_known_name(&self) -> String {
        self.last_known_name
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain security events raised since the last call.
    pub fn take_security_events(&self) -> Vec<SecurityEvent> {
        std::mem::take(&mut *self.security.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Record the channel's events. Called with the channel lock held.
    fn observe(&self, channel: &mut dyn SecureChannel) {
        let events = channel.take_events();
        if events.is_empty() {
            return;
        }
        for event in &events {
            info!(talk = %self.id, event = %event, "Security event");
            match event {
                SecurityEvent::GoneSecure => {
                    *self.peer.lock().unwrap_or_else(|e| e.into_inner()) =
                        channel.peer_identity();
                }
                SecurityEvent::GoneInsecure => self.terminate(),
            }
        }
        self.security
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(events);
        let _ = self
            .connect_events
            .send(ConnectEvent::SecurityChanged { talk: self.id });
    }

    /// Queue fragments for the write pump. Returns false once cancelled.
    async fn enqueue(&self, fragments: Vec<String>, active: &mut watch::Receiver<bool>) -> bool {
        for fragment in fragments {
            tokio::select! {
                _ = cancelled(active) => return false,
                sent = self.pending.send(fragment) => {
                    if sent.is_err() {
                        return false;
                    }
                }
            }
        }
        true
    }

    async fn receive_pump(
        self: Arc<Self>,
        mut source: Box<dyn FrameSource>,
        inbound: mpsc::Sender<String>,
    ) {
        let mut active = self.active.subscribe();
        loop {
            let frame = tokio::select! {
                _ = cancelled(&mut active) => break,
                frame = source.next_frame() => frame,
            };
            let text = match frame {
                Some(Ok(Frame::Text(text))) => text,
                Some(Ok(Frame::Ping | Frame::Pong)) => continue,
                Some(Ok(other)) => {
                    debug!(talk = %self.id, frame = ?other, "Non-text frame, closing");
                    break;
                }
                Some(Err(e)) => {
                    warn!(talk = %self.id, error = %e, "Transport read failed");
                    break;
                }
                None => {
                    debug!(talk = %self.id, "Transport closed by peer");
                    break;
                }
            };

            let plaintext = {
                let mut channel = self.channel.lock().await;
                let result = channel.receive(&text);
                self.observe(channel.as_mut());
                match result {
                    Ok(exchange) => {
                        if !self.enqueue(exchange.fragments, &mut active).await {
                            break;
                        }
                        exchange.plaintext
                    }
                    Err(e) => {
                        warn!(talk = %self.id, error = %e, "Unable to receive message");
                        None
                    }
                }
            };

            if let Some(text) = plaintext.filter(|t| !t.is_empty()) {
                tokio::select! {
                    _ = cancelled(&mut active) => break,
                    sent = inbound.send(text) => {
                        if sent.is_err() {
                            debug!(talk = %self.id, "Inbound consumer gone");
                        }
                    }
                }
            }
        }
        self.terminate();
    }

    async fn outbound_pump(self: Arc<Self>, mut outbound: mpsc::Receiver<String>) {
        let mut active = self.active.subscribe();
        loop {
            let line = tokio::select! {
                _ = cancelled(&mut active) => break,
                line = outbound.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };

            let mut channel = self.channel.lock().await;
            let result = channel.send(&line);
            self.observe(channel.as_mut());
            match result {
                Ok(fragments) => {
                    if !self.enqueue(fragments, &mut active).await {
                        break;
                    }
                }
                Err(e) => warn!(talk = %self.id, error = %e, "Unable to process outgoing message"),
            }
        }
        self.terminate();
    }

    async fn write_pump(
        self: Arc<Self>,
        mut sink: Box<dyn FrameSink>,
        mut pending: mpsc::Receiver<String>,
        keepalive: Duration,
    ) {
        let mut active = self.active.subscribe();
        // One timer for the whole talk, reset after every data write.
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keepalive, keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut active) => break,
                fragment = pending.recv() => {
                    let Some(fragment) = fragment else { break };
                    if let Err(e) = sink.send_frame(Frame::Text(fragment)).await {
                        warn!(talk = %self.id, error = %e, "Transport write failed");
                        break;
                    }
                    ticker.reset();
                }
                _ = ticker.tick() => {
                    if let Err(e) = sink.send_frame(Frame::Ping).await {
                        warn!(talk = %self.id, error = %e, "Keepalive failed");
                        break;
                    }
                }
            }
        }

        self.terminate();
        if let Err(e) = sink.close().await {
            debug!(talk = %self.id, error = %e, "Transport close failed");
        }
    }
}

impl fmt::Debug for Talk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Talk")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("peer_addr", &self.peer_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, Exchange, SecurityState};
    use crate::registry::SessionRegistry;
    use async_trait::async_trait;
    use std::sync::Mutex as TestMutex;
    use tulip_types::Attestation;

    /// Channel that "encrypts" by splitting each line into single-character
    /// fragments prefixed with the line number.
    struct Splitter {
        lines: usize,
        peer: Option<Fingerprint>,
        events: Vec<SecurityEvent>,
    }

    impl Splitter {
        fn new() -> Self {
            Self {
                lines: 0,
                peer: None,
                events: Vec::new(),
            }
        }
    }

    impl SecureChannel for Splitter {
        fn receive(&mut self, message: &str) -> Result<Exchange, ChannelError> {
            match message {
                "secure" => {
                    self.peer = Some(Fingerprint::from_hex("aa55").unwrap());
                    self.events.push(SecurityEvent::GoneSecure);
                    Ok(Exchange::default())
                }
                "end" => {
                    self.events.push(SecurityEvent::GoneInsecure);
                    Ok(Exchange::default())
                }
                "bad" => Err(ChannelError::Malformed("bad".into())),
                other => Ok(Exchange {
                    plaintext: Some(other.to_string()),
                    fragments: vec![format!("ack:{other}")],
                }),
            }
        }

        fn send(&mut self, plaintext: &str) -> Result<Vec<String>, ChannelError> {
            self.lines += 1;
            Ok(plaintext
                .chars()
                .map(|c| format!("{}:{c}", self.lines))
                .collect())
        }

        fn take_events(&mut self) -> Vec<SecurityEvent> {
            std::mem::take(&mut self.events)
        }

        fn peer_identity(&self) -> Option<Fingerprint> {
            self.peer.clone()
        }

        fn state(&self) -> SecurityState {
            if self.peer.is_some() {
                SecurityState::Secure
            } else {
                SecurityState::Unbound
            }
        }
    }

    fn spawn_talk(
        transport: Transport,
    ) -> (
        Arc<Talk>,
        mpsc::Receiver<String>,
        mpsc::UnboundedReceiver<ConnectEvent>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = TalkConfig {
            queue_capacity: 64,
            keepalive: Duration::from_secs(3600),
        };
        let (talk, inbound) = Talk::spawn(
            transport,
            Box::new(Splitter::new()),
            TalkOrigin::Inbound,
            &config,
            events_tx,
        );
        (talk, inbound, events_rx)
    }

    async fn next_text(transport: &mut Transport) -> String {
        loop {
            match transport.source.next_frame().await {
                Some(Ok(Frame::Text(text))) => return text,
                Some(Ok(Frame::Ping)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_outbound_lines_keep_fragment_order() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (talk, _inbound, _events) = spawn_talk(local);

        talk.send("abc").await.unwrap();
        talk.send("de").await.unwrap();

        let mut written = Vec::new();
        for _ in 0..5 {
            written.push(next_text(&mut remote).await);
        }
        assert_eq!(written, vec!["1:a", "1:b", "1:c", "2:d", "2:e"]);
    }

    #[tokio::test]
    async fn test_inbound_plaintext_and_reply() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (_talk, mut inbound, _events) = spawn_talk(local);

        remote
            .sink
            .send_frame(Frame::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "hello");
        assert_eq!(next_text(&mut remote).await, "ack:hello");
    }

    #[tokio::test]
    async fn test_processing_error_is_not_fatal() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (talk, mut inbound, _events) = spawn_talk(local);

        remote.sink.send_frame(Frame::Text("bad".into())).await.unwrap();
        remote.sink.send_frame(Frame::Ping).await.unwrap();
        remote
            .sink
            .send_frame(Frame::Text("still here".into()))
            .await
            .unwrap();
        assert_eq!(inbound.recv().await.unwrap(), "still here");
        assert!(talk.is_active());
    }

    #[tokio::test]
    async fn test_gone_secure_binds_identity_and_name() {
        let (local, remote) = Transport::memory_pair(64);
        let (talk, _inbound, mut events) = spawn_talk(local);
        let mut remote = remote;

        let mut book = AddressBook::new();
        assert_eq!(talk.best_name(&book), "");

        remote.sink.send_frame(Frame::Text("secure".into())).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectEvent::SecurityChanged { talk: talk.id() }
        );
        assert_eq!(talk.take_security_events(), vec![SecurityEvent::GoneSecure]);
        assert_eq!(talk.best_name(&book), "aa55");

        book.add("carol", Attestation::parse("aa55", "fp").unwrap());
        assert_eq!(talk.best_name(&book), "carol");
        assert_eq!(talk.last_known_name(), "carol");
    }

    #[tokio::test]
    async fn test_gone_insecure_terminates_and_notifies_once() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (talk, _inbound, mut events) = spawn_talk(local);
        let book = AddressBook::new();

        remote.sink.send_frame(Frame::Text("secure".into())).await.unwrap();
        events.recv().await.unwrap();
        assert_eq!(talk.best_name(&book), "aa55");

        remote.sink.send_frame(Frame::Text("end".into())).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), talk.closed())
            .await
            .expect("talk did not close");
        assert!(!talk.is_active());

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if let ConnectEvent::Disconnected { name, .. } = event {
                assert_eq!(name, "aa55");
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
        assert!(talk.send("too late").await.is_err());
    }

    #[tokio::test]
    async fn test_terminate_stops_all_writes() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (talk, _inbound, _events) = spawn_talk(local);

        talk.terminate();
        talk.terminate();
        tokio::time::timeout(Duration::from_secs(5), talk.closed())
            .await
            .expect("pumps did not stop");

        assert!(talk.send("after").await.is_err());
        // Only the close frame follows termination.
        assert_eq!(remote.source.next_frame().await.unwrap().unwrap(), Frame::Close);
        assert!(remote.source.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_non_text_frame_is_fatal() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (talk, _inbound, _events) = spawn_talk(local);

        remote.sink.send_frame(Frame::Binary(vec![1])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), talk.closed())
            .await
            .expect("talk did not close");
    }

    /// Sink whose writes always fail.
    struct BrokenSink {
        writes: Arc<TestMutex<usize>>,
    }

    #[async_trait]
    impl FrameSink for BrokenSink {
        async fn send_frame(&mut self, _frame: Frame) -> Result<(), WireError> {
            *self.writes.lock().unwrap() += 1;
            Err(WireError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), WireError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure_ends_bound_talk() {
        let (local, mut remote) = Transport::memory_pair(64);
        let writes = Arc::new(TestMutex::new(0));
        let transport = Transport::new(
            local.source,
            Box::new(BrokenSink {
                writes: Arc::clone(&writes),
            }),
            "broken",
        );
        let (talk, _inbound, mut events) = spawn_talk(transport);
        let book = AddressBook::new();
        let mut registry = SessionRegistry::new();
        registry.admit(Arc::clone(&talk));

        remote.sink.send_frame(Frame::Text("secure".into())).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectEvent::SecurityChanged { talk: talk.id() }
        );
        assert_eq!(registry.reconcile(&book).bound, vec!["aa55".to_string()]);

        talk.send("x").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), talk.closed())
            .await
            .expect("talk did not close");
        assert_eq!(*writes.lock().unwrap(), 1);

        let report = registry.reconcile(&book);
        assert_eq!(report.dropped, vec!["aa55".to_string()]);
        assert!(registry.is_empty());

        let mut disconnects = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectEvent::Disconnected { talk: id, name } = event {
                assert_eq!(id, talk.id());
                disconnects.push(name);
            }
        }
        assert_eq!(disconnects, vec!["aa55".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_when_idle() {
        let (local, mut remote) = Transport::memory_pair(64);
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = TalkConfig {
            queue_capacity: 8,
            keepalive: Duration::from_secs(2),
        };
        let (_talk, _inbound) = Talk::spawn(
            local,
            Box::new(Splitter::new()),
            TalkOrigin::Outbound,
            &config,
            events_tx,
        );

        assert_eq!(remote.source.next_frame().await.unwrap().unwrap(), Frame::Ping);
        assert_eq!(remote.source.next_frame().await.unwrap().unwrap(), Frame::Ping);
    }
}
