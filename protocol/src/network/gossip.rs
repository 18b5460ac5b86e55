//! # Gossip Protocol
//!
//! Flood propagation of triads and validation results between matrix nodes.
//!
//! The engine here performs no network I/O. It is fed decoded frames, store
//! events and timer ticks by the socket runtime (`node.rs`), and returns
//! [`GossipAction`]s for the runtime to execute. It is owned by a single
//! task, so the peer table needs no locking.
//!
//! ## Flooding
//!
//! A `NEW_TRIAD` is re-broadcast to every peer except the one it came from,
//! whether or not the store already held the triad. Each message carries a
//! TTL that drops by one per hop; it is forwarded only while `ttl > 1`.
//!
//! The engine also remembers which triad ids it has already flooded, in a
//! bounded cache. A second copy of the same triad is dropped instead of
//! forwarded, so one triad costs each node at most one round of sends no
//! matter how dense the mesh is. Locally created triads enter the cache
//! when they are announced.
//!
//! `TRIAD_VALIDATED` is re-broadcast only when it actually changed the local
//! copy, which bounds it naturally.
//!
//! ## Isolation
//!
//! A handshake carrying a different network id is answered with `ERROR` and
//! the peer is dropped immediately. Frames from dropped peers that are
//! already in flight are ignored.
//!
//! Until a peer's handshake is accepted, everything it sends other than
//! `HANDSHAKE` and `ERROR` is refused with `ERROR`. Both sides send their
//! handshake first, so a well-behaved peer never hits this.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::matrix::{now_millis, MatrixError, MatrixEvent, TriadStore};
use crate::network::message::{
    Discovery, Handshake, Message, NewTriad, PeerList, ProtocolError, ValidateTriad,
};
use crate::network::peer::{Direction, Peer, PeerId, PeerTable};

// ---------------------------------------------------------------------------
// Gossip Actions
// ---------------------------------------------------------------------------

/// Work the runtime must carry out after the engine processed an input.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    /// Send to one peer.
    Send { peer: PeerId, message: Message },
    /// Send to every connected peer except `exclude`.
    Broadcast {
        message: Message,
        exclude: Option<PeerId>,
    },
    /// Dial a normalized address. The runtime must still go through
    /// [`GossipProtocol::begin_connect`].
    Connect(String),
    /// Close the connection. The peer is already gone from the table.
    Disconnect(PeerId),
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Accepts `host:port` or `ws://host:port` and returns `ws://host:port`.
///
/// ```
/// use triad_protocol::network::normalize_address;
///
/// assert_eq!(normalize_address("127.0.0.1:6001").as_deref(), Some("ws://127.0.0.1:6001"));
/// assert_eq!(normalize_address("ws://Node-A:7000/").as_deref(), Some("ws://node-a:7000"));
/// assert_eq!(normalize_address("http://x:1"), None);
/// ```
pub fn normalize_address(input: &str) -> Option<String> {
    let trimmed = input.trim();
    let rest = trimmed.strip_prefix("ws://").unwrap_or(trimmed);
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        return None;
    }

    let (host, port) = rest.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some(format!("ws://{}:{port}", host.to_ascii_lowercase()))
}

fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let rest = address.strip_prefix("ws://")?;
    let (host, port) = rest.rsplit_once(':')?;
    Some((host, port.parse().ok()?))
}

const LOCAL_HOSTS: [&str; 5] = ["localhost", "127.0.0.1", "0.0.0.0", "[::1]", "[::]"];

// ---------------------------------------------------------------------------
// Gossip Protocol
// ---------------------------------------------------------------------------

/// The gossip protocol engine.
pub struct GossipProtocol {
    config: NodeConfig,
    store: Arc<TriadStore>,
    peers: PeerTable,
    /// Address the listener actually bound to.
    local_addr: Option<SocketAddr>,
    /// Triad ids already flooded, mapped to the order they were first seen.
    seen_triads: HashMap<String, u64>,
    seen_seq: u64,
}

impl GossipProtocol {
    pub fn new(config: NodeConfig, store: Arc<TriadStore>) -> Self {
        Self {
            config,
            store,
            peers: PeerTable::new(),
            local_addr: None,
            seen_triads: HashMap::new(),
            seen_seq: 0,
        }
    }

    /// Records the bound listener address. Port 0 in the configuration is
    /// only resolved once the listener exists.
    pub fn set_local_addr(&mut self, addr: SocketAddr) {
        self.local_addr = Some(addr);
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.snapshot()
    }

    /// Number of triad ids in the flood deduplication cache.
    pub fn seen_count(&self) -> usize {
        self.seen_triads.len()
    }

    /// Records a triad id as flooded. Returns `false` if it already was.
    fn remember_triad(&mut self, id: &str) -> bool {
        if self.seen_triads.contains_key(id) {
            return false;
        }
        self.seen_seq += 1;
        self.seen_triads.insert(id.to_string(), self.seen_seq);
        self.maybe_evict_seen();
        true
    }

    /// Forgets the oldest ids once the cache exceeds capacity, keeping the
    /// newest three quarters.
    fn maybe_evict_seen(&mut self) {
        let capacity = self.config.seen_cache_size;
        if self.seen_triads.len() <= capacity {
            return;
        }
        let keep = (capacity * 3 / 4) as u64;
        let cutoff = self.seen_seq.saturating_sub(keep);
        self.seen_triads.retain(|_, seq| *seq > cutoff);
        debug!(remaining = self.seen_triads.len(), "evicted old entries from seen cache");
    }

    fn local_port(&self) -> u16 {
        self.local_addr
            .map(|a| a.port())
            .unwrap_or_else(|| self.config.listen_addr.port())
    }

    /// The address we tell peers to dial.
    ///
    /// The configured advertised address wins. Otherwise the bound address is
    /// used when it is a concrete IP; a wildcard bind has no usable address.
    pub fn advertised_address(&self) -> Option<String> {
        if let Some(configured) = self.config.advertised_address.as_deref() {
            return normalize_address(configured);
        }
        let bound = self.local_addr.unwrap_or(self.config.listen_addr);
        if bound.ip().is_unspecified() {
            None
        } else {
            normalize_address(&bound.to_string())
        }
    }

    /// Returns `true` if a normalized address points back at this node.
    pub fn is_self_address(&self, address: &str) -> bool {
        if self.advertised_address().as_deref() == Some(address) {
            return true;
        }
        let Some((host, port)) = split_host_port(address) else {
            return false;
        };
        if port != self.local_port() {
            return false;
        }
        if LOCAL_HOSTS.contains(&host) {
            return true;
        }
        let bound = self.local_addr.unwrap_or(self.config.listen_addr);
        normalize_address(&bound.to_string()).as_deref() == Some(address)
    }

    fn handshake(&self) -> Message {
        Message::Handshake(Handshake {
            node_id: self.config.node_id.clone(),
            network_id: self.config.network_id.clone(),
            address: self.advertised_address(),
            timestamp: now_millis(),
        })
    }

    fn discovery(&self) -> Message {
        Message::Discovery(Discovery {
            node_id: self.config.node_id.clone(),
            address: self.advertised_address(),
        })
    }

    fn peer_list(&self, except: PeerId) -> Message {
        Message::Peers(PeerList {
            peers: self.peers.addresses(Some(except)),
        })
    }

    // -- Connection lifecycle ----------------------------------------------

    /// Admits an accepted connection, or returns `None` when at capacity (the
    /// runtime then drops the socket without a handshake).
    pub fn admit_inbound(&mut self, remote: SocketAddr) -> Option<(PeerId, Vec<GossipAction>)> {
        if self.peers.occupancy() >= self.config.max_peers {
            warn!(
                remote = %remote,
                max_peers = self.config.max_peers,
                "peer capacity reached, refusing inbound connection"
            );
            return None;
        }

        let peer = self.peers.insert(Direction::Inbound, None, Some(remote));
        info!(peer, remote = %remote, "inbound peer connected");
        Some((
            peer,
            vec![GossipAction::Send {
                peer,
                message: self.handshake(),
            }],
        ))
    }

    /// Checks whether `address` should be dialed and, if so, marks it as in
    /// flight. Returns the normalized address to dial.
    pub fn begin_connect(&mut self, address: &str) -> Option<String> {
        let Some(address) = normalize_address(address) else {
            warn!(address, "ignoring malformed peer address");
            return None;
        };
        if self.is_self_address(&address) {
            debug!(address = %address, "not dialing own address");
            return None;
        }
        if self.peers.is_known(&address) {
            trace!(address = %address, "already connected or dialing");
            return None;
        }
        if self.peers.occupancy() >= self.config.max_peers {
            debug!(address = %address, "peer capacity reached, not dialing");
            return None;
        }
        self.peers.mark_pending(&address);
        Some(address)
    }

    /// Abandons an in-flight dial.
    pub fn connect_failed(&mut self, address: &str) {
        self.peers.clear_pending(address);
    }

    /// Registers a completed outbound connection. The first frames are our
    /// handshake followed by a discovery request.
    pub fn register_outbound(&mut self, address: &str) -> (PeerId, Vec<GossipAction>) {
        self.peers.clear_pending(address);
        let peer = self
            .peers
            .insert(Direction::Outbound, Some(address.to_string()), None);
        info!(peer, address, "outbound peer connected");
        (
            peer,
            vec![
                GossipAction::Send {
                    peer,
                    message: self.handshake(),
                },
                GossipAction::Send {
                    peer,
                    message: self.discovery(),
                },
            ],
        )
    }

    /// Forgets a peer whose socket closed.
    pub fn peer_closed(&mut self, peer: PeerId) -> Option<Peer> {
        let removed = self.peers.remove(peer);
        if let Some(p) = &removed {
            info!(peer, address = ?p.address, "peer disconnected");
        }
        removed
    }

    // -- Inputs -------------------------------------------------------------

    /// Handles one text frame from `peer`.
    pub fn handle_frame(&mut self, peer: PeerId, text: &str) -> Vec<GossipAction> {
        if !self.peers.contains(peer) {
            trace!(peer, "dropping frame from removed peer");
            return vec![];
        }
        match Message::decode(text) {
            Ok(message) => self.handle_message(peer, message),
            Err(e) => {
                warn!(peer, error = %e, "invalid peer message");
                vec![GossipAction::Send {
                    peer,
                    message: Message::error(e.to_string()),
                }]
            }
        }
    }

    /// Handles one decoded message from `peer`.
    pub fn handle_message(&mut self, peer: PeerId, message: Message) -> Vec<GossipAction> {
        if !self.peers.contains(peer) {
            return vec![];
        }
        trace!(peer, kind = message.kind(), "peer message");

        let exempt = matches!(message, Message::Handshake(_) | Message::Error(_));
        if !exempt && !self.peers.is_handshaken(peer) {
            warn!(peer, kind = message.kind(), "message before handshake refused");
            return vec![GossipAction::Send {
                peer,
                message: Message::error(format!("handshake required before {}", message.kind())),
            }];
        }

        match message {
            Message::Handshake(handshake) => self.on_handshake(peer, handshake),
            Message::Discovery(discovery) => self.on_discovery(peer, discovery),
            Message::Peers(list) => self.on_peers(list),
            Message::NewTriad(new_triad) => self.on_new_triad(peer, new_triad),
            Message::ValidateTriad(request) => self.on_validate_triad(peer, request),
            Message::TriadValidated(triad) => match self.store.apply_remote_validation(&triad) {
                Ok(true) => vec![GossipAction::Broadcast {
                    message: Message::TriadValidated(triad),
                    exclude: Some(peer),
                }],
                Ok(false) => vec![],
                Err(e) => {
                    warn!(peer, triad_id = %triad.id, error = %e, "could not apply remote validation");
                    vec![]
                }
            },
            Message::GetStatus => vec![GossipAction::Send {
                peer,
                message: Message::StatusUpdate(self.store.get_matrix_state()),
            }],
            Message::StatusUpdate(snapshot) => {
                debug!(
                    peer,
                    triads = snapshot.triads_count,
                    validators = snapshot.validators.len(),
                    "peer status"
                );
                vec![]
            }
            Message::Error(payload) => {
                warn!(peer, message = %payload.message, "peer reported an error");
                vec![]
            }
        }
    }

    fn on_handshake(&mut self, peer: PeerId, handshake: Handshake) -> Vec<GossipAction> {
        if handshake.network_id != self.config.network_id {
            let err = ProtocolError::NetworkMismatch {
                expected: self.config.network_id.clone(),
                actual: handshake.network_id,
            };
            warn!(peer, remote_node = %handshake.node_id, error = %err, "handshake rejected");
            self.peers.remove(peer);
            return vec![
                GossipAction::Send {
                    peer,
                    message: Message::error(err.to_string()),
                },
                GossipAction::Disconnect(peer),
            ];
        }

        if handshake.node_id == self.config.node_id {
            info!(peer, "connection loops back to this node, dropping");
            self.peers.remove(peer);
            return vec![GossipAction::Disconnect(peer)];
        }

        let advertised = handshake
            .address
            .as_deref()
            .and_then(normalize_address)
            .filter(|a| !self.is_self_address(a));

        if let Some(record) = self.peers.get_mut(peer) {
            record.node_id = Some(handshake.node_id.clone());
            record.handshaken = true;
            if record.address.is_none() {
                record.address = advertised;
            }
        }
        info!(peer, remote_node = %handshake.node_id, "peer handshake completed");

        vec![GossipAction::Send {
            peer,
            message: self.peer_list(peer),
        }]
    }

    fn on_discovery(&mut self, peer: PeerId, discovery: Discovery) -> Vec<GossipAction> {
        let advertised = discovery
            .address
            .as_deref()
            .and_then(normalize_address)
            .filter(|a| !self.is_self_address(a));
        if let Some(record) = self.peers.get_mut(peer) {
            if record.address.is_none() {
                record.address = advertised;
            }
        }

        vec![GossipAction::Send {
            peer,
            message: self.peer_list(peer),
        }]
    }

    fn on_peers(&self, list: PeerList) -> Vec<GossipAction> {
        let mut seen = HashSet::new();
        list.peers
            .iter()
            .filter_map(|a| normalize_address(a))
            .filter(|a| !self.is_self_address(a) && !self.peers.is_known(a))
            .filter(|a| seen.insert(a.clone()))
            .map(GossipAction::Connect)
            .collect()
    }

    fn on_new_triad(&mut self, peer: PeerId, new_triad: NewTriad) -> Vec<GossipAction> {
        let NewTriad { triad, ttl } = new_triad;

        if self.seen_triads.contains_key(&triad.id) {
            trace!(peer, triad_id = %triad.id, "triad already flooded");
            return vec![];
        }

        if !self.store.contains(&triad.id) {
            match self.store.import_triad(triad.clone()) {
                Ok(true) => info!(peer, triad_id = %triad.id, "received new triad"),
                Ok(false) => {}
                Err(MatrixError::InvalidInput(reason)) => {
                    warn!(peer, triad_id = %triad.id, reason = %reason, "rejected triad from peer");
                    return vec![GossipAction::Send {
                        peer,
                        message: Message::error(format!("invalid triad {}: {reason}", triad.id)),
                    }];
                }
                Err(e) => warn!(peer, triad_id = %triad.id, error = %e, "could not store triad"),
            }
        }
        self.remember_triad(&triad.id);

        if ttl > 1 {
            vec![GossipAction::Broadcast {
                message: Message::NewTriad(NewTriad { triad, ttl: ttl - 1 }),
                exclude: Some(peer),
            }]
        } else {
            trace!(peer, triad_id = %triad.id, "triad ttl exhausted");
            vec![]
        }
    }

    fn on_validate_triad(&mut self, peer: PeerId, request: ValidateTriad) -> Vec<GossipAction> {
        match self.store.validate_triad(&request.id, &request.validator) {
            Ok(triad) => {
                debug!(peer, triad_id = %triad.id, validated = triad.validated, "validation requested by peer");
                vec![]
            }
            Err(e) => vec![GossipAction::Send {
                peer,
                message: Message::error(e.to_string()),
            }],
        }
    }

    /// Translates local store events into broadcasts.
    pub fn on_matrix_event(&mut self, event: &MatrixEvent) -> Vec<GossipAction> {
        let message = match event {
            MatrixEvent::TriadCreated(triad) => {
                // Echoes from peers must not be flooded back out.
                self.remember_triad(&triad.id);
                Message::NewTriad(NewTriad {
                    triad: triad.clone(),
                    ttl: self.config.gossip_ttl,
                })
            }
            MatrixEvent::TriadValidated(triad) => Message::TriadValidated(triad.clone()),
            _ => return vec![],
        };
        if self.peers.is_empty() {
            return vec![];
        }
        vec![GossipAction::Broadcast {
            message,
            exclude: None,
        }]
    }

    /// Periodic announcement while the mesh is under half capacity.
    pub fn discovery_tick(&self) -> Vec<GossipAction> {
        let count = self.peers.len();
        if count == 0 || count as f64 >= self.config.max_peers as f64 / 2.0 {
            return vec![];
        }
        debug!(peers = count, "announcing for discovery");
        vec![GossipAction::Broadcast {
            message: self.discovery(),
            exclude: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::config::{MatrixConfig, GOSSIP_TTL};
    use crate::matrix::{Position, Triad};
    use crate::network::message::ErrorPayload;
    use crate::storage::MatrixDB;
    use serde_json::json;

    fn make_store() -> Arc<TriadStore> {
        let store =
            TriadStore::new(MatrixDB::open_temporary().unwrap(), MatrixConfig::default()).unwrap();
        store.initialize().unwrap();
        Arc::new(store)
    }

    fn make_config() -> NodeConfig {
        NodeConfig {
            node_id: "local-node".to_string(),
            network_id: "testnet".to_string(),
            listen_addr: "127.0.0.1:7000".parse().unwrap(),
            max_peers: 4,
            ..NodeConfig::default()
        }
    }

    fn make_engine() -> (GossipProtocol, Arc<TriadStore>) {
        let store = make_store();
        let mut engine = GossipProtocol::new(make_config(), Arc::clone(&store));
        engine.set_local_addr("127.0.0.1:7000".parse().unwrap());
        (engine, store)
    }

    fn inbound(engine: &mut GossipProtocol, port: u16) -> PeerId {
        let remote: SocketAddr = format!("10.0.0.9:{port}").parse().unwrap();
        engine.admit_inbound(remote).unwrap().0
    }

    /// An inbound peer whose handshake was accepted.
    fn ready_peer(engine: &mut GossipProtocol, port: u16) -> PeerId {
        let peer = inbound(engine, port);
        engine.handle_message(
            peer,
            handshake_from(&format!("remote-{port}"), "testnet", None),
        );
        peer
    }

    fn handshake_from(node_id: &str, network_id: &str, address: Option<&str>) -> Message {
        Message::Handshake(Handshake {
            node_id: node_id.to_string(),
            network_id: network_id.to_string(),
            address: address.map(str::to_string),
            timestamp: 1,
        })
    }

    fn remote_triad(id: &str, validated: bool) -> Triad {
        Triad {
            id: id.to_string(),
            data: json!({"from": "peer"}),
            validator: "TRDremote".to_string(),
            timestamp: 10,
            position: Position::new(1, 1, 1),
            validated,
            consensus: if validated { 0.9 } else { 0.0 },
            validation_attempts: u32::from(validated),
        }
    }

    fn sent_to(actions: &[GossipAction], target: PeerId) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                GossipAction::Send { peer, message } if *peer == target => Some(message),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn inbound_peer_gets_unprompted_handshake() {
        let (mut engine, _) = make_engine();
        let (peer, actions) = engine
            .admit_inbound("10.0.0.9:5000".parse().unwrap())
            .unwrap();

        let sent = sent_to(&actions, peer);
        assert_eq!(sent.len(), 1);
        match sent[0] {
            Message::Handshake(h) => {
                assert_eq!(h.node_id, "local-node");
                assert_eq!(h.network_id, "testnet");
                assert_eq!(h.address.as_deref(), Some("ws://127.0.0.1:7000"));
            }
            other => panic!("expected handshake, got {other:?}"),
        }
        assert_eq!(engine.peer_count(), 1);
    }

    #[test]
    fn inbound_refused_at_capacity() {
        let store = make_store();
        let config = NodeConfig {
            max_peers: 1,
            ..make_config()
        };
        let mut engine = GossipProtocol::new(config, store);

        assert!(engine.admit_inbound("10.0.0.1:1".parse().unwrap()).is_some());
        assert!(engine.admit_inbound("10.0.0.2:1".parse().unwrap()).is_none());
        assert_eq!(engine.peer_count(), 1);
    }

    #[test]
    fn network_mismatch_drops_peer_and_ignores_later_frames() {
        let (mut engine, store) = make_engine();
        let peer = inbound(&mut engine, 5000);

        let actions = engine.handle_message(peer, handshake_from("other", "mainnet", None));
        assert!(matches!(
            sent_to(&actions, peer).as_slice(),
            [Message::Error(ErrorPayload { message })] if message.contains("network mismatch")
        ));
        assert_eq!(actions.last(), Some(&GossipAction::Disconnect(peer)));
        assert_eq!(engine.peer_count(), 0);

        let frame = Message::NewTriad(NewTriad {
            triad: remote_triad("aa", false),
            ttl: 3,
        })
        .encode()
        .unwrap();
        assert!(engine.handle_frame(peer, &frame).is_empty());
        assert_eq!(store.triad_count(), 0);
    }

    #[test]
    fn matching_handshake_replies_with_known_peers() {
        let (mut engine, _) = make_engine();
        let (_, _) = engine.register_outbound("ws://10.0.0.5:6001");
        let peer = inbound(&mut engine, 5000);

        let actions =
            engine.handle_message(peer, handshake_from("remote", "testnet", Some("10.0.0.9:6001")));
        match sent_to(&actions, peer).as_slice() {
            [Message::Peers(list)] => assert_eq!(list.peers, vec!["ws://10.0.0.5:6001"]),
            other => panic!("expected PEERS, got {other:?}"),
        }

        let record = engine.peers().into_iter().find(|p| p.id == peer).unwrap();
        assert!(record.handshaken);
        assert_eq!(record.node_id.as_deref(), Some("remote"));
        assert_eq!(record.address.as_deref(), Some("ws://10.0.0.9:6001"));
    }

    #[test]
    fn handshake_from_self_is_dropped() {
        let (mut engine, _) = make_engine();
        let peer = inbound(&mut engine, 5000);
        let actions = engine.handle_message(peer, handshake_from("local-node", "testnet", None));
        assert_eq!(actions, vec![GossipAction::Disconnect(peer)]);
    }

    #[test]
    fn outbound_sends_handshake_then_discovery() {
        let (mut engine, _) = make_engine();
        let address = engine.begin_connect("10.0.0.5:6001").unwrap();
        assert_eq!(address, "ws://10.0.0.5:6001");
        // Already dialing.
        assert!(engine.begin_connect("ws://10.0.0.5:6001").is_none());

        let (peer, actions) = engine.register_outbound(&address);
        let sent = sent_to(&actions, peer);
        assert!(matches!(sent[0], Message::Handshake(_)));
        assert!(matches!(sent[1], Message::Discovery(_)));
        // Connected now.
        assert!(engine.begin_connect("10.0.0.5:6001").is_none());
    }

    #[test]
    fn begin_connect_refuses_self_and_capacity() {
        let (mut engine, _) = make_engine();
        assert!(engine.begin_connect("127.0.0.1:7000").is_none());
        assert!(engine.begin_connect("localhost:7000").is_none());
        assert!(engine.begin_connect("ws://0.0.0.0:7000").is_none());
        assert!(engine.begin_connect("not an address").is_none());

        for i in 0..4 {
            assert!(engine.begin_connect(&format!("10.0.0.{i}:6001")).is_some());
        }
        assert!(engine.begin_connect("10.0.0.200:6001").is_none());

        engine.connect_failed("ws://10.0.0.0:6001");
        assert!(engine.begin_connect("10.0.0.200:6001").is_some());
    }

    #[test]
    fn peers_message_dials_only_new_addresses() {
        let (mut engine, _) = make_engine();
        engine.register_outbound("ws://10.0.0.5:6001");
        let peer = ready_peer(&mut engine, 5000);

        let actions = engine.handle_message(
            peer,
            Message::Peers(PeerList {
                peers: vec![
                    "ws://10.0.0.5:6001".to_string(),
                    "127.0.0.1:7000".to_string(),
                    "10.0.0.6:6001".to_string(),
                    "ws://10.0.0.6:6001".to_string(),
                    "garbage".to_string(),
                ],
            }),
        );
        assert_eq!(
            actions,
            vec![GossipAction::Connect("ws://10.0.0.6:6001".to_string())]
        );
    }

    #[test]
    fn new_triad_is_imported_and_forwarded_with_lower_ttl() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let triad = remote_triad("0123456789abcdef0123456789abcdef", false);

        let actions = engine.handle_message(
            peer,
            Message::NewTriad(NewTriad {
                triad: triad.clone(),
                ttl: 5,
            }),
        );
        assert_eq!(store.get_triad(&triad.id).unwrap(), Some(triad.clone()));
        assert_eq!(
            actions,
            vec![GossipAction::Broadcast {
                message: Message::NewTriad(NewTriad {
                    triad: triad.clone(),
                    ttl: 4
                }),
                exclude: Some(peer),
            }]
        );

        // Second copy: no second record, not flooded again.
        let again = engine.handle_message(peer, Message::NewTriad(NewTriad { triad, ttl: 5 }));
        assert_eq!(store.triad_count(), 1);
        assert!(again.is_empty());
    }

    #[test]
    fn triad_already_in_store_is_still_forwarded_once() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let triad = remote_triad("ab", false);
        store.import_triad(triad.clone()).unwrap();

        let first = engine.handle_message(
            peer,
            Message::NewTriad(NewTriad {
                triad: triad.clone(),
                ttl: 3,
            }),
        );
        assert_eq!(first.len(), 1);
        assert_eq!(store.triad_count(), 1);

        let second = engine.handle_message(peer, Message::NewTriad(NewTriad { triad, ttl: 3 }));
        assert!(second.is_empty());
    }

    #[test]
    fn echo_of_local_triad_is_not_reflooded() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let triad = store.create_triad(json!("mine"), "TRDv").unwrap();
        engine.on_matrix_event(&MatrixEvent::TriadCreated(triad.clone()));

        let echo = engine.handle_message(peer, Message::NewTriad(NewTriad { triad, ttl: 7 }));
        assert!(echo.is_empty());
    }

    #[test]
    fn seen_cache_keeps_newest_entries_when_full() {
        let store = make_store();
        let config = NodeConfig {
            seen_cache_size: 8,
            ..make_config()
        };
        let mut engine = GossipProtocol::new(config, store);
        let peer = ready_peer(&mut engine, 5000);

        for i in 0..9 {
            engine.handle_message(
                peer,
                Message::NewTriad(NewTriad {
                    triad: remote_triad(&format!("id{i}"), false),
                    ttl: 1,
                }),
            );
        }
        // Ninth id overflowed the cache of 8; the newest 6 remain.
        assert_eq!(engine.seen_count(), 6);

        // The oldest id was forgotten and floods again; the newest does not.
        let old = engine.handle_message(
            peer,
            Message::NewTriad(NewTriad {
                triad: remote_triad("id0", false),
                ttl: 2,
            }),
        );
        assert_eq!(old.len(), 1);
        let recent = engine.handle_message(
            peer,
            Message::NewTriad(NewTriad {
                triad: remote_triad("id8", false),
                ttl: 2,
            }),
        );
        assert!(recent.is_empty());
    }

    /// Routes engine actions across a simulated mesh. `links[i][j]` is the
    /// peer id node `i` uses for node `j`.
    fn route(
        links: &[Vec<Option<PeerId>>],
        from: usize,
        actions: Vec<GossipAction>,
        queue: &mut VecDeque<(usize, usize, Message)>,
    ) {
        for action in actions {
            match action {
                GossipAction::Send { peer, message } => {
                    if let Some(to) = links[from].iter().position(|l| *l == Some(peer)) {
                        queue.push_back((from, to, message));
                    }
                }
                GossipAction::Broadcast { message, exclude } => {
                    for (to, link) in links[from].iter().enumerate() {
                        if link.is_some() && *link != exclude {
                            queue.push_back((from, to, message.clone()));
                        }
                    }
                }
                GossipAction::Connect(_) | GossipAction::Disconnect(_) => {}
            }
        }
    }

    #[test]
    fn full_mesh_flood_sends_each_triad_once_per_link() {
        const NODES: usize = 6;
        let mut nodes: Vec<(GossipProtocol, Arc<TriadStore>)> =
            (0..NODES).map(|_| make_engine()).collect();
        let mut links = vec![vec![None; NODES]; NODES];
        for i in 0..NODES {
            for j in (0..NODES).filter(|j| *j != i) {
                let engine = &mut nodes[i].0;
                let (peer, _) = engine.register_outbound(&format!("ws://10.0.1.{j}:6001"));
                engine.handle_message(peer, handshake_from(&format!("node-{j}"), "testnet", None));
                links[i][j] = Some(peer);
            }
        }

        let triad = nodes[0].1.create_triad(json!("flood"), "TRDorigin").unwrap();
        let mut queue = VecDeque::new();
        let announce = nodes[0]
            .0
            .on_matrix_event(&MatrixEvent::TriadCreated(triad.clone()));
        route(&links, 0, announce, &mut queue);

        let mut deliveries = 0;
        while let Some((from, to, message)) = queue.pop_front() {
            deliveries += 1;
            assert!(deliveries <= 1_000, "flood did not settle");
            let peer = links[to][from].unwrap();
            let actions = nodes[to].0.handle_message(peer, message);
            route(&links, to, actions, &mut queue);
        }

        // The origin sends to everyone; every other node forwards exactly once.
        assert_eq!(deliveries, (NODES - 1) + (NODES - 1) * (NODES - 2));
        for (_, store) in &nodes {
            assert_eq!(store.get_triad(&triad.id).unwrap(), Some(triad.clone()));
        }
    }

    #[test]
    fn messages_before_handshake_are_refused() {
        let (mut engine, store) = make_engine();
        let peer = inbound(&mut engine, 5000);
        store.import_triad(remote_triad("ff", false)).unwrap();

        let requests = vec![
            Message::NewTriad(NewTriad {
                triad: remote_triad("0f", true),
                ttl: 4,
            }),
            Message::ValidateTriad(ValidateTriad {
                id: "ff".to_string(),
                validator: "TRDv".to_string(),
            }),
            Message::TriadValidated(remote_triad("ff", true)),
            Message::GetStatus,
            Message::Peers(PeerList {
                peers: vec!["10.0.0.6:6001".to_string()],
            }),
        ];
        for request in requests {
            let actions = engine.handle_message(peer, request);
            assert!(matches!(
                actions.as_slice(),
                [GossipAction::Send { message: Message::Error(ErrorPayload { message }), .. }]
                    if message.contains("handshake required")
            ));
        }

        assert_eq!(store.triad_count(), 1);
        let untouched = store.get_triad("ff").unwrap().unwrap();
        assert!(!untouched.validated);
        assert_eq!(untouched.validation_attempts, 0);
        // Refusal keeps the connection; the peer may still handshake.
        assert_eq!(engine.peer_count(), 1);

        engine.handle_message(peer, handshake_from("late", "testnet", None));
        let status = engine.handle_message(peer, Message::GetStatus);
        assert!(matches!(sent_to(&status, peer).as_slice(), [Message::StatusUpdate(_)]));
    }

    #[test]
    fn new_triad_with_spent_ttl_is_not_forwarded() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let actions = engine.handle_message(
            peer,
            Message::NewTriad(NewTriad {
                triad: remote_triad("bb", false),
                ttl: 1,
            }),
        );
        assert!(actions.is_empty());
        assert_eq!(store.triad_count(), 1);
    }

    #[test]
    fn out_of_bounds_triad_is_rejected_and_not_forwarded() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let mut triad = remote_triad("cc", false);
        triad.position = Position::new(9, 0, 0);

        let actions = engine.handle_message(peer, Message::NewTriad(NewTriad { triad, ttl: 5 }));
        assert!(matches!(sent_to(&actions, peer).as_slice(), [Message::Error(_)]));
        assert_eq!(actions.len(), 1);
        assert_eq!(store.triad_count(), 0);
    }

    #[test]
    fn validate_unknown_triad_replies_error() {
        let (mut engine, _) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        let actions = engine.handle_message(
            peer,
            Message::ValidateTriad(ValidateTriad {
                id: "missing".to_string(),
                validator: "TRDv".to_string(),
            }),
        );
        assert!(matches!(
            sent_to(&actions, peer).as_slice(),
            [Message::Error(ErrorPayload { message })] if message.contains("not found")
        ));
    }

    #[test]
    fn validate_known_triad_does_not_rebroadcast() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        store.import_triad(remote_triad("dd", false)).unwrap();

        let actions = engine.handle_message(
            peer,
            Message::ValidateTriad(ValidateTriad {
                id: "dd".to_string(),
                validator: "TRDv".to_string(),
            }),
        );
        assert!(actions.is_empty());
        assert_eq!(
            store.get_triad("dd").unwrap().unwrap().validation_attempts,
            1
        );
    }

    #[test]
    fn triad_validated_applies_once_and_rebroadcasts_once() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        store.import_triad(remote_triad("ee", false)).unwrap();

        let validated = remote_triad("ee", true);
        let first = engine.handle_message(peer, Message::TriadValidated(validated.clone()));
        assert_eq!(
            first,
            vec![GossipAction::Broadcast {
                message: Message::TriadValidated(validated.clone()),
                exclude: Some(peer),
            }]
        );
        assert!(store.get_triad("ee").unwrap().unwrap().validated);

        let second = engine.handle_message(peer, Message::TriadValidated(validated));
        assert!(second.is_empty());
    }

    #[test]
    fn get_status_returns_snapshot() {
        let (mut engine, store) = make_engine();
        let peer = ready_peer(&mut engine, 5000);
        store.create_triad(json!("x"), "TRDv").unwrap();

        let actions = engine.handle_message(peer, Message::GetStatus);
        match sent_to(&actions, peer).as_slice() {
            [Message::StatusUpdate(snapshot)] => assert_eq!(snapshot.triads_count, 1),
            other => panic!("expected STATUS_UPDATE, got {other:?}"),
        }
    }

    #[test]
    fn bad_frames_get_error_but_keep_connection() {
        let (mut engine, _) = make_engine();
        let peer = inbound(&mut engine, 5000);

        let malformed = engine.handle_frame(peer, "{{{");
        assert!(matches!(sent_to(&malformed, peer).as_slice(), [Message::Error(_)]));

        let unknown = engine.handle_frame(peer, r#"{"type":"SHOUT","payload":null}"#);
        assert!(matches!(
            sent_to(&unknown, peer).as_slice(),
            [Message::Error(ErrorPayload { message })] if message.contains("SHOUT")
        ));
        assert_eq!(engine.peer_count(), 1);
    }

    #[test]
    fn error_messages_are_not_answered() {
        let (mut engine, _) = make_engine();
        let peer = inbound(&mut engine, 5000);
        assert!(engine.handle_message(peer, Message::error("boom")).is_empty());
    }

    #[test]
    fn local_events_are_broadcast_without_exclusion() {
        let (mut engine, store) = make_engine();
        inbound(&mut engine, 5000);
        let triad = store.create_triad(json!("local"), "TRDv").unwrap();

        let actions = engine.on_matrix_event(&MatrixEvent::TriadCreated(triad.clone()));
        assert_eq!(
            actions,
            vec![GossipAction::Broadcast {
                message: Message::NewTriad(NewTriad {
                    triad: triad.clone(),
                    ttl: GOSSIP_TTL
                }),
                exclude: None,
            }]
        );
        assert!(engine
            .on_matrix_event(&MatrixEvent::TriadImported(triad))
            .is_empty());
    }

    #[test]
    fn discovery_only_below_half_capacity() {
        let (mut engine, _) = make_engine();
        assert!(engine.discovery_tick().is_empty());

        inbound(&mut engine, 5000);
        assert_eq!(engine.discovery_tick().len(), 1);

        inbound(&mut engine, 5001);
        // 2 of 4 is not below half.
        assert!(engine.discovery_tick().is_empty());
    }

    #[test]
    fn closed_peer_is_forgotten() {
        let (mut engine, _) = make_engine();
        let peer = inbound(&mut engine, 5000);
        assert!(engine.peer_closed(peer).is_some());
        assert!(engine.peer_closed(peer).is_none());
        assert_eq!(engine.peer_count(), 0);
    }

    #[test]
    fn address_normalization() {
        assert_eq!(
            normalize_address(" 10.0.0.1:6001 ").as_deref(),
            Some("ws://10.0.0.1:6001")
        );
        assert_eq!(normalize_address("ws://[::1]:6001").as_deref(), Some("ws://[::1]:6001"));
        assert_eq!(normalize_address("10.0.0.1"), None);
        assert_eq!(normalize_address("10.0.0.1:0"), None);
        assert_eq!(normalize_address(":6001"), None);
        assert_eq!(normalize_address("ws://host:6001/path"), None);
    }

    #[test]
    fn advertised_address_overrides_bound_address() {
        let store = make_store();
        let config = NodeConfig {
            advertised_address: Some("node.example:9000".to_string()),
            ..make_config()
        };
        let engine = GossipProtocol::new(config, store);
        assert_eq!(
            engine.advertised_address().as_deref(),
            Some("ws://node.example:9000")
        );
        assert!(engine.is_self_address("ws://node.example:9000"));
    }

    #[test]
    fn wildcard_bind_has_no_advertised_address() {
        let store = make_store();
        let config = NodeConfig {
            listen_addr: "0.0.0.0:7000".parse().unwrap(),
            ..make_config()
        };
        let engine = GossipProtocol::new(config, store);
        assert_eq!(engine.advertised_address(), None);
        assert!(engine.is_self_address("ws://127.0.0.1:7000"));
        assert!(!engine.is_self_address("ws://127.0.0.1:7001"));
    }
}
