//! # Gossip Node
//!
//! The socket runtime around [`GossipProtocol`]. One actor task owns the
//! engine and every per-peer outbox; everything else talks to it through
//! channels:
//!
//! ```text
//!   listener task ──Accepted──▶ ┌───────────┐ ◀──Command── NodeHandle
//!   peer tasks ─Frame/Closed──▶ │   actor   │ ◀──MatrixEvent── TriadStore
//!   dial tasks ──Dialed───────▶ │ (engine)  │ ◀──tick── discovery interval
//!                               └───────────┘
//!                                     │ outbox (text frames)
//!                                     ▼
//!                                 peer tasks
//! ```
//!
//! Peer tasks only move frames between the WebSocket and the actor, so the
//! peer table and the store are only ever touched by one handler at a time.
//!
//! ## Shutdown
//!
//! `NodeHandle::shutdown` stops the listener, closes every peer socket,
//! drops the discovery timer and closes the store, in that order. Every
//! step runs even if an earlier one failed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, Interval};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::matrix::{MatrixError, MatrixEvent, TriadStore};
use crate::network::gossip::{GossipAction, GossipProtocol};
use crate::network::message::{Message, ProtocolError};
use crate::network::peer::{Peer, PeerId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The remote answered with an `ERROR` message.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error(transparent)]
    Store(#[from] MatrixError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The actor task has exited.
    #[error("node is not running")]
    Stopped,
}

pub type NodeResult<T> = Result<T, NodeError>;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

enum Command {
    Connect(String),
    PeerCount(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<Peer>>),
}

/// Inputs produced by the listener, dial and peer tasks.
enum RuntimeEvent {
    Accepted(TcpStream, SocketAddr),
    Dialed {
        address: String,
        result: NodeResult<WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>>,
    },
    Frame(PeerId, String),
    Closed(PeerId),
}

struct PeerLink {
    outbox: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Node Handle
// ---------------------------------------------------------------------------

/// Control handle for a running node.
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    shutdown: watch::Sender<bool>,
    actor: JoinHandle<NodeResult<()>>,
    local_addr: SocketAddr,
}

impl NodeHandle {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Dials `address` (`host:port` or `ws://host:port`). Returns once the
    /// request is queued; the dial itself is asynchronous and silently
    /// skipped when it would exceed capacity or duplicate a connection.
    pub async fn connect(&self, address: &str) -> NodeResult<()> {
        self.commands
            .send(Command::Connect(address.to_string()))
            .await
            .map_err(|_| NodeError::Stopped)
    }

    pub async fn peer_count(&self) -> NodeResult<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::PeerCount(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    pub async fn peers(&self) -> NodeResult<Vec<Peer>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Stops the node and waits for cleanup to finish.
    pub async fn shutdown(self) -> NodeResult<()> {
        // The actor may already be gone; joining below reports that.
        let _ = self.shutdown.send(true);
        match self.actor.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "gossip node task failed");
                Err(NodeError::Stopped)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Gossip Node
// ---------------------------------------------------------------------------

/// Entry point for starting the socket runtime.
pub struct GossipNode;

impl GossipNode {
    /// Binds the listener and spawns the node's tasks.
    ///
    /// The store should already be started. The node registers a lossless
    /// listener on it, so a burst of local triads is never skipped.
    pub async fn start(config: NodeConfig, store: Arc<TriadStore>) -> NodeResult<NodeHandle> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: config.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let listener_task = tokio::spawn(accept_loop(
            listener,
            event_tx.clone(),
            shutdown_rx.clone(),
        ));

        let mut engine = GossipProtocol::new(config, Arc::clone(&store));
        engine.set_local_addr(local_addr);

        info!(
            listen = %local_addr,
            node_id = %engine.config().node_id,
            network_id = %engine.config().network_id,
            "gossip node listening"
        );

        let actor = Actor {
            engine,
            store_events: store.listen(),
            store,
            links: HashMap::new(),
            events: event_tx,
            listener: Some(listener_task),
        };
        let actor = tokio::spawn(actor.run(command_rx, event_rx, shutdown_rx));

        Ok(NodeHandle {
            commands: command_tx,
            shutdown: shutdown_tx,
            actor,
            local_addr,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if events.send(RuntimeEvent::Accepted(stream, remote)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("listener stopped");
}

/// Moves frames between one WebSocket and the actor. Ends when either side
/// closes or the outbox is dropped; pending outbox frames are sent first.
async fn drive_peer<S>(
    peer: PeerId,
    ws: WebSocketStream<S>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            outgoing = outbox.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                        debug!(peer, error = %e, "send failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if events.send(RuntimeEvent::Frame(peer, text.as_str().to_owned())).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => trace!(peer, "ignoring non-text frame"),
                Some(Err(e)) => {
                    debug!(peer, error = %e, "peer socket error");
                    break;
                }
            },
        }
    }
    let _ = events.send(RuntimeEvent::Closed(peer));
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    engine: GossipProtocol,
    store: Arc<TriadStore>,
    store_events: mpsc::UnboundedReceiver<MatrixEvent>,
    links: HashMap<PeerId, PeerLink>,
    events: mpsc::UnboundedSender<RuntimeEvent>,
    listener: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<RuntimeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> NodeResult<()> {
        let period = self.engine.config().discovery_interval;
        let mut discovery = interval_at(Instant::now() + period, period);
        let mut store_open = true;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    // Every handle dropped without shutdown.
                    None => break,
                },
                Some(event) = events.recv() => self.on_runtime_event(event),
                event = self.store_events.recv(), if store_open => match event {
                    Some(event) => {
                        let actions = self.engine.on_matrix_event(&event);
                        self.execute(actions);
                    }
                    None => store_open = false,
                },
                _ = discovery.tick() => {
                    let actions = self.engine.discovery_tick();
                    self.execute(actions);
                }
            }
        }

        self.shutdown(discovery).await
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(address) => self.dial(&address),
            Command::PeerCount(reply) => {
                let _ = reply.send(self.engine.peer_count());
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.engine.peers());
            }
        }
    }

    fn on_runtime_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Accepted(stream, remote) => self.accept(stream, remote),
            RuntimeEvent::Dialed { address, result } => match result {
                Ok(ws) => {
                    let (peer, actions) = self.engine.register_outbound(&address);
                    self.attach(peer, |outbox, events| {
                        tokio::spawn(drive_peer(peer, ws, outbox, events))
                    });
                    self.execute(actions);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "failed to connect to peer");
                    self.engine.connect_failed(&address);
                }
            },
            RuntimeEvent::Frame(peer, text) => {
                let actions = self.engine.handle_frame(peer, &text);
                self.execute(actions);
            }
            RuntimeEvent::Closed(peer) => {
                self.engine.peer_closed(peer);
                self.links.remove(&peer);
            }
        }
    }

    fn accept(&mut self, stream: TcpStream, remote: SocketAddr) {
        let Some((peer, actions)) = self.engine.admit_inbound(remote) else {
            // Dropping the stream closes it before any handshake.
            drop(stream);
            return;
        };

        let handshake_timeout = self.engine.config().handshake_timeout;
        self.attach(peer, move |outbox, events| {
            tokio::spawn(async move {
                match timeout(handshake_timeout, accept_async(stream)).await {
                    Ok(Ok(ws)) => drive_peer(peer, ws, outbox, events).await,
                    Ok(Err(e)) => {
                        debug!(peer, error = %e, "websocket upgrade failed");
                        let _ = events.send(RuntimeEvent::Closed(peer));
                    }
                    Err(_) => {
                        debug!(peer, "websocket upgrade timed out");
                        let _ = events.send(RuntimeEvent::Closed(peer));
                    }
                }
            })
        });
        self.execute(actions);
    }

    fn attach<F>(&mut self, peer: PeerId, spawn: F)
    where
        F: FnOnce(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<RuntimeEvent>) -> JoinHandle<()>,
    {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let task = spawn(outbox_rx, self.events.clone());
        self.links.insert(peer, PeerLink { outbox, task });
    }

    fn dial(&mut self, address: &str) {
        let Some(address) = self.engine.begin_connect(address) else {
            return;
        };
        debug!(address = %address, "dialing peer");

        let handshake_timeout = self.engine.config().handshake_timeout;
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = match timeout(handshake_timeout, connect_async(address.as_str())).await {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(NodeError::from(e)),
                Err(_) => Err(NodeError::Timeout),
            };
            let _ = events.send(RuntimeEvent::Dialed { address, result });
        });
    }

    fn send(&self, peer: PeerId, text: String) {
        if let Some(link) = self.links.get(&peer) {
            if link.outbox.send(text).is_err() {
                trace!(peer, "peer task already finished");
            }
        }
    }

    fn execute(&mut self, actions: Vec<GossipAction>) {
        for action in actions {
            match action {
                GossipAction::Send { peer, message } => {
                    if let Some(text) = encode(&message) {
                        self.send(peer, text);
                    }
                }
                GossipAction::Broadcast { message, exclude } => {
                    let Some(text) = encode(&message) else {
                        continue;
                    };
                    for (&peer, link) in &self.links {
                        if Some(peer) != exclude {
                            let _ = link.outbox.send(text.clone());
                        }
                    }
                }
                GossipAction::Connect(address) => self.dial(&address),
                GossipAction::Disconnect(peer) => {
                    self.engine.peer_closed(peer);
                    // Dropping the outbox lets the task flush and close.
                    self.links.remove(&peer);
                }
            }
        }
    }

    async fn shutdown(mut self, discovery: Interval) -> NodeResult<()> {
        info!("gossip node shutting down");

        if let Some(listener) = self.listener.take() {
            listener.abort();
            if let Err(e) = listener.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "listener task failed");
                }
            }
        }

        let links: Vec<(PeerId, PeerLink)> = self.links.drain().collect();
        let closed = links.len();
        for (peer, link) in links {
            link.task.abort();
            self.engine.peer_closed(peer);
        }
        debug!(closed, "peer sockets closed");

        drop(discovery);

        let result = self.store.close().map_err(NodeError::from);
        if let Err(e) = &result {
            error!(error = %e, "failed to close matrix store");
        }
        info!("gossip node stopped");
        result
    }
}

fn encode(message: &Message) -> Option<String> {
    match message.encode() {
        Ok(text) => Some(text),
        Err(e) => {
            error!(kind = message.kind(), error = %e, "failed to encode message");
            None
        }
    }
}
