//! Connection establishment: inbound accept and outbound dial.
//!
//! Both paths end in [`Talk::spawn`]; the resulting talk and its inbound
//! plaintext queue are handed to the command loop over one queue of
//! [`NewTalk`]s. Nothing here touches the registry.

use crate::channel::ChannelFactory;
use crate::error::WireError;
use crate::talk::{ConnectEvent, Talk, TalkConfig, TalkOrigin};
use crate::transport::Transport;
use async_trait::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};
use tulip_types::OnionAddress;

/// Opens a transport to a peer's talk endpoint.
#[async_trait]
pub trait ProxyDialer: Send + Sync {
    async fn dial(&self, address: &OnionAddress, path: &str) -> Result<Transport, WireError>;
}

/// Dials onion services through tor's SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    proxy: String,
    port: u16,
}

impl SocksDialer {
    pub fn new(proxy: impl Into<String>, port: u16) -> Self {
        Self {
            proxy: proxy.into(),
            port,
        }
    }
}

#[async_trait]
impl ProxyDialer for SocksDialer {
    async fn dial(&self, address: &OnionAddress, path: &str) -> Result<Transport, WireError> {
        let host = address.as_str();
        debug!(proxy = %self.proxy, host, "Dialing through SOCKS proxy");
        let stream: Socks5Stream<TcpStream> =
            Socks5Stream::connect(self.proxy.as_str(), (host, self.port)).await?;

        let url = if self.port == 80 {
            format!("ws://{host}{path}")
        } else {
            format!("ws://{host}:{}{path}", self.port)
        };
        let (ws, _response) = tokio_tungstenite::client_async(url, stream).await?;
        Ok(Transport::from_tungstenite(ws, host))
    }
}

/// A talk handed to the command loop.
#[derive(Debug)]
pub struct NewTalk {
    pub talk: Arc<Talk>,
    /// Decrypted lines from the peer.
    pub inbound: mpsc::Receiver<String>,
}

/// Creates talks for accepted and dialed connections.
#[derive(Clone)]
pub struct SessionNode {
    factory: Arc<dyn ChannelFactory>,
    config: TalkConfig,
    talk_path: String,
    new_talks: mpsc::Sender<NewTalk>,
    connect_events: mpsc::UnboundedSender<ConnectEvent>,
}

impl SessionNode {
    /// Create a node. Returns the receivers for new talks and for
    /// connection events.
    pub fn new(
        factory: Arc<dyn ChannelFactory>,
        config: TalkConfig,
        talk_path: impl Into<String>,
    ) -> (
        Self,
        mpsc::Receiver<NewTalk>,
        mpsc::UnboundedReceiver<ConnectEvent>,
    ) {
        let mut talk_path = talk_path.into();
        if !talk_path.starts_with('/') {
            talk_path.insert(0, '/');
        }
        let (new_talks, new_talks_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (connect_events, events_rx) = mpsc::unbounded_channel();
        let node = Self {
            factory,
            config,
            talk_path,
            new_talks,
            connect_events,
        };
        (node, new_talks_rx, events_rx)
    }

    pub fn talk_path(&self) -> &str {
        &self.talk_path
    }

    /// Sender for connection events, for collaborators outside the node.
    pub fn connect_events(&self) -> mpsc::UnboundedSender<ConnectEvent> {
        self.connect_events.clone()
    }

    fn start_talk(&self, transport: Transport, origin: TalkOrigin) -> NewTalk {
        let (talk, inbound) = Talk::spawn(
            transport,
            self.factory.open(),
            origin,
            &self.config,
            self.connect_events.clone(),
        );
        NewTalk { talk, inbound }
    }

    /// Start a talk for an accepted connection. The peer speaks first.
    pub async fn accept(&self, transport: Transport) -> Result<Arc<Talk>, WireError> {
        let new = self.start_talk(transport, TalkOrigin::Inbound);
        let talk = Arc::clone(&new.talk);
        if self.new_talks.send(new).await.is_err() {
            talk.terminate();
            return Err(WireError::TalkClosed(talk.id().to_string()));
        }
        Ok(talk)
    }

    /// Start a talk for a dialed connection and prime its handshake.
    pub async fn connect(&self, transport: Transport) -> Result<Arc<Talk>, WireError> {
        let new = self.start_talk(transport, TalkOrigin::Outbound);
        let talk = Arc::clone(&new.talk);
        // Any outbound line solicits the handshake; an empty one carries nothing.
        talk.send("").await?;
        if self.new_talks.send(new).await.is_err() {
            talk.terminate();
            return Err(WireError::TalkClosed(talk.id().to_string()));
        }
        Ok(talk)
    }

    /// Dial `address` in the background. Failures surface as
    /// [`ConnectEvent::DialFailed`].
    pub fn dial(&self, dialer: Arc<dyn ProxyDialer>, address: OnionAddress) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            info!(address = %address, "Connecting");
            let result = match dialer.dial(&address, &node.talk_path).await {
                Ok(transport) => node.connect(transport).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(address = %address, error = %e, "Dial failed");
                let _ = node.connect_events.send(ConnectEvent::DialFailed {
                    address: address.to_string(),
                    error: e.to_string(),
                });
            }
        })
    }

    /// Router exposing the talk endpoint.
    fn router(&self) -> Router {
        Router::new()
            .route(&self.talk_path, get(talk_upgrade))
            .with_state(self.clone())
    }

    /// Accept talks on `listener` until `shutdown` is raised.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WireError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Talk endpoint listening on {addr}{}", self.talk_path);
        }
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
                info!("Talk endpoint shutting down");
            })
            .await?;
        Ok(())
    }
}

async fn talk_upgrade(
    State(node): State<SessionNode>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        debug!(%remote, "Accepted talk connection");
        let transport = Transport::from_axum(socket, remote.to_string());
        if let Err(e) = node.accept(transport).await {
            warn!(%remote, error = %e, "Dropping accepted connection");
        }
    })
}
