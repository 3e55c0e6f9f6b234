//! The command loop.
//!
//! One task owns the address book, the registry and the current-talk
//! selection. It multiplexes operator lines, newly created talks, connection
//! events and every talk's inbound plaintext, and reconciles the registry
//! after each of them.

use crate::command::{parse_command, Command, CommandError, Target, HELP};
use crate::ui;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, info};
use tulip_types::{Attestation, Fingerprint, OnionAddress};
use tulip_wire::{
    AddressBook, ConnectEvent, NewTalk, ProxyDialer, Reconciliation, SessionNode,
    SessionRegistry, Talk, TalkId, TalkOrigin,
};

/// Something to show the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Warn(String),
    Alert(String),
    Message { from: String, text: String },
    Echo(String),
}

impl Notice {
    pub fn show(&self) {
        match self {
            Self::Info(msg) => ui::info(msg),
            Self::Warn(msg) => ui::warn(msg),
            Self::Alert(msg) => ui::alert(msg),
            Self::Message { from, text } => ui::message(from, text),
            Self::Echo(text) => ui::echo(text),
        }
    }
}

/// Whether the loop keeps going after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Session {
    node: SessionNode,
    dialer: Arc<dyn ProxyDialer>,
    book: AddressBook,
    registry: SessionRegistry,
    talks: HashMap<TalkId, Arc<Talk>>,
    inbound: StreamMap<TalkId, ReceiverStream<String>>,
    current: Option<Arc<Talk>>,
    fingerprint: Fingerprint,
    onion: Option<OnionAddress>,
}

impl Session {
    pub fn new(
        node: SessionNode,
        dialer: Arc<dyn ProxyDialer>,
        book: AddressBook,
        fingerprint: Fingerprint,
        onion: Option<OnionAddress>,
    ) -> Self {
        Self {
            node,
            dialer,
            book,
            registry: SessionRegistry::new(),
            talks: HashMap::new(),
            inbound: StreamMap::new(),
            current: None,
            fingerprint,
            onion,
        }
    }

    /// Run until `/quit` or end of input.
    pub async fn run(
        mut self,
        mut lines: mpsc::Receiver<String>,
        mut new_talks: mpsc::Receiver<NewTalk>,
        mut events: mpsc::UnboundedReceiver<ConnectEvent>,
    ) {
        loop {
            let notices = tokio::select! {
                line = lines.recv() => {
                    let Some(line) = line else { break };
                    let (flow, notices) = self.handle_line(&line).await;
                    show(&notices);
                    if flow == Flow::Quit {
                        break;
                    }
                    Vec::new()
                }
                Some(new) = new_talks.recv() => self.admit(new),
                Some(event) = events.recv() => self.on_event(event),
                Some((id, text)) = self.inbound.next(), if !self.inbound.is_empty() => {
                    self.on_message(id, &text)
                }
            };
            show(&notices);
            show(&self.reconcile());
        }

        info!("Command loop finished, hanging up");
        self.registry.hang_up_all();
        for talk in self.talks.values() {
            talk.terminate();
        }
    }

    /// Parse and execute one operator line.
    pub async fn handle_line(&mut self, line: &str) -> (Flow, Vec<Notice>) {
        let result = match parse_command(line) {
            Ok(Command::Quit) => return (Flow::Quit, Vec::new()),
            Ok(command) => self.dispatch(command).await,
            Err(e) => Err(e),
        };
        let notices = result.unwrap_or_else(|e| vec![Notice::Warn(e.to_string())]);
        (Flow::Continue, notices)
    }

    async fn dispatch(&mut self, command: Command) -> Result<Vec<Notice>, CommandError> {
        debug!(command = ?command, "Dispatching");
        match command {
            Command::Chat(line) => self.chat(line).await,
            Command::ListTalks => Ok(self.list_talks()),
            Command::Select(name) => {
                let talk = self
                    .registry
                    .get(&name)
                    .filter(|talk| talk.is_active())
                    .ok_or_else(|| CommandError::NoSuchTalk(name.clone()))?;
                self.current = Some(Arc::clone(talk));
                Ok(vec![Notice::Info(format!("Talking to {name}."))])
            }
            Command::AddEntry { alias, value, kind } => {
                let attestation = Attestation::parse(&value, kind.as_str())?;
                self.book.add(&alias, attestation);
                Ok(vec![Notice::Info(format!("Added {kind} {value} for {alias}."))])
            }
            Command::Connect(target) => {
                let address = match target {
                    Target::Address(address) => address,
                    Target::Alias(alias) => self
                        .book
                        .get(&alias)
                        .and_then(|person| person.onion_address())
                        .cloned()
                        .ok_or(CommandError::NotOnion(alias))?,
                };
                self.node.dial(Arc::clone(&self.dialer), address.clone());
                Ok(vec![Notice::Info(format!("Connecting to {address}..."))])
            }
            Command::ListBook => Ok(self.list_book()),
            Command::WhoAmI => {
                let onion = self
                    .onion
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "not published".to_string());
                Ok(vec![
                    Notice::Info(format!("Fingerprint: {}", self.fingerprint)),
                    Notice::Info(format!("Onion: {onion}")),
                ])
            }
            Command::Help => Ok(HELP
                .iter()
                .map(|(usage, what)| Notice::Info(format!("{usage:<30} {what}")))
                .collect()),
            Command::Quit => Ok(Vec::new()),
        }
    }

    async fn chat(&mut self, line: String) -> Result<Vec<Notice>, CommandError> {
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let talk = self
            .current
            .as_ref()
            .filter(|talk| talk.is_active())
            .ok_or(CommandError::NoActiveTalk)?;
        talk.send(line.clone())
            .await
            .map_err(|_| CommandError::NoActiveTalk)?;
        Ok(vec![Notice::Echo(line)])
    }

    fn list_talks(&self) -> Vec<Notice> {
        if self.registry.is_empty() {
            return vec![Notice::Info("No secure talks.".to_string())];
        }
        let current = self.current.as_ref().map(|talk| talk.id());
        self.registry
            .iter()
            .map(|(name, entry)| {
                let marker = if Some(entry.talk.id()) == current { ">" } else { "*" };
                Notice::Info(format!(
                    "[{marker}] {name} (since {})",
                    entry.bound_at.format("%H:%M:%S")
                ))
            })
            .collect()
    }

    fn list_book(&self) -> Vec<Notice> {
        if self.book.is_empty() {
            return vec![Notice::Info("Address book is empty.".to_string())];
        }
        self.book
            .iter()
            .map(|(alias, person)| {
                let entries: Vec<String> = person
                    .entries
                    .iter()
                    .map(|e| format!("{} {}", e.kind(), e.value()))
                    .collect();
                Notice::Info(format!("{alias}: {}", entries.join(", ")))
            })
            .collect()
    }

    /// Take ownership of a freshly created talk.
    pub fn admit(&mut self, new: NewTalk) -> Vec<Notice> {
        let NewTalk { talk, inbound } = new;
        let id = talk.id();
        self.registry.admit(Arc::clone(&talk));
        self.inbound.insert(id, ReceiverStream::new(inbound));
        let notice = match talk.origin() {
            TalkOrigin::Inbound => format!("Incoming talk {id} from {}", talk.peer_addr()),
            TalkOrigin::Outbound => format!("Talk {id} connected to {}", talk.peer_addr()),
        };
        self.talks.insert(id, talk);
        vec![Notice::Info(notice)]
    }

    pub fn on_event(&mut self, event: ConnectEvent) -> Vec<Notice> {
        match event {
            ConnectEvent::SecurityChanged { talk } => {
                debug!(talk = %talk, "Security changed");
                Vec::new()
            }
            ConnectEvent::Disconnected { name, .. } => {
                vec![Notice::Alert(format!("{name} has disconnected."))]
            }
            ConnectEvent::DialFailed { address, error } => {
                vec![Notice::Warn(format!("Unable to connect to {address}: {error}"))]
            }
        }
    }

    pub fn on_message(&mut self, id: TalkId, text: &str) -> Vec<Notice> {
        let from = self
            .talks
            .get(&id)
            .map(|talk| talk.best_name(&self.book))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| id.to_string());
        vec![Notice::Message {
            from,
            text: text.to_string(),
        }]
    }

    /// Run one registry reconciliation pass.
    pub fn reconcile(&mut self) -> Vec<Notice> {
        let report = self.registry.reconcile(&self.book);
        self.talks.retain(|_, talk| talk.is_active());
        if self.current.as_ref().is_some_and(|talk| !talk.is_active()) {
            self.current = None;
        }
        report_notices(&report)
    }
}

fn report_notices(report: &Reconciliation) -> Vec<Notice> {
    let mut notices = Vec::new();
    for name in &report.replaced {
        notices.push(Notice::Warn(format!(
            "{name} connected again, hanging up the older talk."
        )));
    }
    for (wanted, assigned) in &report.collisions {
        notices.push(Notice::Warn(format!(
            "{wanted} is already talking from another identity; this one is {assigned}."
        )));
    }
    for name in &report.bound {
        notices.push(Notice::Info(format!("Talk with {name} is secure.")));
    }
    for (old, new) in &report.renamed {
        notices.push(Notice::Info(format!("{old} is now known as {new}.")));
    }
    notices
}

fn show(notices: &[Notice]) {
    for notice in notices {
        notice.show();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tulip_wire::{
        LocalIdentity, SealedChannelFactory, TalkConfig, Transport, WireError,
    };

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct CountingDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProxyDialer for CountingDialer {
        async fn dial(&self, _address: &OnionAddress, _path: &str) -> Result<Transport, WireError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WireError::Transport("tor is not running".into()))
        }
    }

    struct Fixture {
        session: Session,
        dialer: Arc<CountingDialer>,
        new_talks: mpsc::Receiver<NewTalk>,
        events: mpsc::UnboundedReceiver<ConnectEvent>,
        identity: Arc<LocalIdentity>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(LocalIdentity::generate());
        let factory = Arc::new(SealedChannelFactory::new(Arc::clone(&identity), 140));
        let (node, new_talks, events) = SessionNode::new(factory, TalkConfig::default(), "/tulip");
        let dialer = Arc::new(CountingDialer::default());
        let session = Session::new(
            node,
            dialer.clone(),
            AddressBook::new(),
            identity.fingerprint(),
            None,
        );
        Fixture {
            session,
            dialer,
            new_talks,
            events,
            identity,
        }
    }

    fn warned(notices: &[Notice]) -> bool {
        notices.iter().any(|n| matches!(n, Notice::Warn(_)))
    }

    #[tokio::test]
    async fn test_connect_without_onion_suffix_is_refused() {
        let mut f = fixture();
        let (flow, notices) = f.session.handle_line("/connect notarealaddress").await;
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            notices,
            vec![Notice::Warn(
                "It's not an onion address: notarealaddress".into()
            )]
        );
        tokio::task::yield_now().await;
        assert_eq!(f.dialer.calls.load(Ordering::SeqCst), 0);
        assert!(f.session.registry.is_empty());
        assert_eq!(f.session.registry.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_connect_by_alias_dials_onion() {
        let mut f = fixture();
        f.session
            .handle_line("/addab bob bobbobbobbob.onion onion")
            .await;
        let (_, notices) = f.session.handle_line("/connect bob").await;
        assert_eq!(
            notices,
            vec![Notice::Info("Connecting to bobbobbobbob.onion...".into())]
        );

        let event = tokio::time::timeout(WAIT, f.events.recv())
            .await
            .unwrap()
            .unwrap();
        let notices = f.session.on_event(event);
        assert!(warned(&notices));
        assert_eq!(f.dialer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_chat_without_talk_warns() {
        let mut f = fixture();
        let (_, notices) = f.session.handle_line("hello?").await;
        assert_eq!(
            notices,
            vec![Notice::Warn("There is no active talk.".into())]
        );
        let (_, notices) = f.session.handle_line("").await;
        assert!(notices.is_empty());
    }

    #[tokio::test]
    async fn test_usage_errors_are_warnings() {
        let mut f = fixture();
        for line in ["/addab alice", "/frob", "/ nobody", "/connect"] {
            let (flow, notices) = f.session.handle_line(line).await;
            assert_eq!(flow, Flow::Continue);
            assert!(warned(&notices), "no warning for {line}");
        }
        assert_eq!(f.session.handle_line("/quit").await.0, Flow::Quit);
    }

    #[tokio::test]
    async fn test_address_book_commands() {
        let mut f = fixture();
        let (_, notices) = f.session.handle_line("/ab").await;
        assert_eq!(notices, vec![Notice::Info("Address book is empty.".into())]);

        f.session
            .handle_line("/addab alice 2264d806e7789a5773bdaffb798bcf3fdb456a81 otr-fp")
            .await;
        let (_, notices) = f.session.handle_line("/ab").await;
        assert_eq!(
            notices,
            vec![Notice::Info(
                "alice: fp 2264d806e7789a5773bdaffb798bcf3fdb456a81".into()
            )]
        );

        let (_, notices) = f.session.handle_line("/whoami").await;
        assert_eq!(
            notices[0],
            Notice::Info(format!("Fingerprint: {}", f.identity.fingerprint()))
        );
    }

    #[tokio::test]
    async fn test_peer_becomes_selectable_and_chat_flows() {
        let mut f = fixture();

        // The peer: a bare talk on its own node.
        let peer_id = Arc::new(LocalIdentity::generate());
        let peer_factory = Arc::new(SealedChannelFactory::new(Arc::clone(&peer_id), 140));
        let (peer_node, mut peer_talks, _peer_events) =
            SessionNode::new(peer_factory, TalkConfig::default(), "/tulip");

        f.session
            .handle_line(&format!("/addab alice {} otr-fp", peer_id.fingerprint()))
            .await;

        let (ours, theirs) = Transport::memory_pair(64);
        f.session.node.accept(ours).await.unwrap();
        peer_node.connect(theirs).await.unwrap();
        let mut peer = peer_talks.recv().await.unwrap();

        let new = f.new_talks.recv().await.unwrap();
        let id = new.talk.id();
        f.session.admit(new);

        loop {
            let event = tokio::time::timeout(WAIT, f.events.recv())
                .await
                .unwrap()
                .unwrap();
            if event == (ConnectEvent::SecurityChanged { talk: id }) {
                break;
            }
        }
        let notices = f.session.reconcile();
        assert_eq!(notices, vec![Notice::Info("Talk with alice is secure.".into())]);

        let (_, notices) = f.session.handle_line("/ alice").await;
        assert_eq!(notices, vec![Notice::Info("Talking to alice.".into())]);
        let (_, notices) = f.session.handle_line("hi alice").await;
        assert_eq!(notices, vec![Notice::Echo("hi alice".into())]);

        let line = tokio::time::timeout(WAIT, peer.inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "hi alice");

        peer.talk.send("hello back").await.unwrap();
        let (from_id, text) = tokio::time::timeout(WAIT, f.session.inbound.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            f.session.on_message(from_id, &text),
            vec![Notice::Message {
                from: "alice".into(),
                text: "hello back".into()
            }]
        );
    }
}
