//! Main P2P node orchestrator.
//!
//! Owns the connection registry, the membership view and the gossip
//! seen-sets, runs the accept loop, drains the shared packet sink and
//! dispatches `broadcast`/`send`/`request`/`respond` through [`P2pHandle`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::P2pConfig;
use crate::error::{P2pError, P2pResult};
use crate::gossip::{GossipState, InboundMessage};
use crate::peer::{delta, Address, Peer, PeerManager};
use crate::protocol::{AckMessage, GossipMessage, Message};
use crate::raintree::{Hop, RainTree};
use crate::registry::ConnectionRegistry;
use crate::socket::{Connect, Dialer, Packet, Runner, Socket, SocketOptions, TcpDialer};

/// How long shutdown waits for each socket's loops to exit.
const SOCKET_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// State shared by the node loop, packet handlers and every handle.
struct NodeShared {
    config: Arc<P2pConfig>,
    address: Address,
    peers: PeerManager,
    registry: ConnectionRegistry,
    gossip: GossipState,
    dialer: Arc<dyn Dialer>,
    inbox_tx: RwLock<Option<mpsc::Sender<InboundMessage>>>,
    token: CancellationToken,
}

/// Main P2P node.
pub struct P2pNode {
    /// Shared state, also reachable through handles.
    shared: Arc<NodeShared>,
    /// Packets from every socket that no request was waiting for.
    sink_rx: Option<mpsc::Receiver<Packet>>,
    /// Shutdown signal receiver.
    shutdown_rx: Option<mpsc::Receiver<()>>,
    /// Shutdown signal sender (for cloning).
    shutdown_tx: mpsc::Sender<()>,
    /// Channel to send the bound address when the node starts.
    bound_addr_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl P2pNode {
    /// Create a node dialing over TCP.
    ///
    /// `validators` seeds the peer view. Must be called from within a
    /// tokio runtime.
    pub fn new(config: P2pConfig, validators: Vec<Peer>) -> P2pResult<Self> {
        Self::with_dialer(config, validators, Arc::new(TcpDialer))
    }

    /// Create a node using `dialer` for outbound connections.
    pub fn with_dialer(
        config: P2pConfig,
        mut validators: Vec<Peer>,
        dialer: Arc<dyn Dialer>,
    ) -> P2pResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let address = config.address.clone();

        if let Some(external) = &config.external_address {
            if !validators.iter().any(|p| p.address == address) {
                validators.push(Peer::new(address.clone(), external.clone()));
            }
        }

        let token = CancellationToken::new();
        let (sink_tx, sink_rx) = mpsc::channel(config.sink_capacity);
        let runner = Runner::new(sink_tx, token.clone())
            .with_on_opened(|socket| {
                tracing::info!(
                    addr = %socket.addr(),
                    direction = %socket.direction(),
                    "Connection established"
                );
            })
            .with_on_closed(|socket| {
                tracing::debug!(
                    addr = %socket.addr(),
                    direction = %socket.direction(),
                    error = socket.error().as_deref().unwrap_or("none"),
                    "Connection closed"
                );
            });

        let registry = ConnectionRegistry::new(
            config.max_inbound,
            config.max_outbound,
            SocketOptions::from_config(&config),
            runner,
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let shared = Arc::new(NodeShared {
            peers: PeerManager::new(address.clone(), validators),
            gossip: GossipState::new(config.seen_cache_capacity),
            address,
            registry,
            dialer,
            inbox_tx: RwLock::new(None),
            token,
            config,
        });

        Ok(Self {
            shared,
            sink_rx: Some(sink_rx),
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx,
            bound_addr_tx: None,
        })
    }

    /// Get a oneshot receiver that will receive the bound address when the node starts.
    /// This is useful for tests that need to know the actual port when using port 0.
    pub fn bound_addr_receiver(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.bound_addr_tx = Some(tx);
        rx
    }

    /// Get a receiver for application payloads.
    /// Replaces any receiver handed out before.
    pub fn inbox_receiver(&mut self) -> mpsc::Receiver<InboundMessage> {
        let (tx, rx) = mpsc::channel(self.shared.config.sink_capacity);
        *self.shared.inbox_tx.write() = Some(tx);
        rx
    }

    /// Get the shutdown sender for external shutdown signals.
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Get a handle for issuing operations while the node runs.
    pub fn handle(&self) -> P2pHandle {
        P2pHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the P2P node until shutdown.
    pub async fn run(mut self) -> P2pResult<()> {
        let listener = TcpListener::bind(self.shared.config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            address = %self.shared.address,
            peers = self.shared.peers.len(),
            "P2P node listening"
        );

        // Send bound address to receiver if one was set up
        if let Some(tx) = self.bound_addr_tx.take() {
            let _ = tx.send(local_addr);
        }

        let mut shutdown_rx = self.shutdown_rx.take().ok_or(P2pError::Shutdown)?;
        let mut sink_rx = self.sink_rx.take().ok_or(P2pError::Shutdown)?;

        // Initial connection attempt
        self.warm_up();

        loop {
            tokio::select! {
                // Handle shutdown
                _ = shutdown_rx.recv() => {
                    tracing::info!("P2P node shutting down");
                    break;
                }
                _ = self.shared.token.cancelled() => {
                    tracing::info!("P2P node cancelled");
                    break;
                }

                // Accept inbound connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr),
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept error");
                        }
                    }
                }

                // Handle packets no request was waiting for. Direct payloads
                // are delivered in arrival order without waiting on the inbox;
                // envelopes get their own task since relaying waits on acks.
                Some(packet) = sink_rx.recv() => {
                    if packet.wrapped {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            shared.handle_envelope(packet).await;
                        });
                    } else {
                        self.shared.try_deliver(InboundMessage::direct(
                            packet.peer_addr,
                            packet.nonce,
                            packet.data,
                        ));
                    }
                }
            }
        }

        self.shutdown_sockets().await;
        Ok(())
    }

    /// Dial every bootstrap peer in the background.
    fn warm_up(&self) {
        for url in self.shared.config.peers.clone() {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                match shared.dial(&url).await {
                    Ok(_) => tracing::debug!(addr = %url, "Bootstrap peer connected"),
                    Err(e) => tracing::warn!(addr = %url, error = %e, "Bootstrap peer unreachable"),
                }
            });
        }
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let socket = match self.shared.registry.inbound.get(&addr.to_string()) {
            Ok((socket, _)) => socket,
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Rejecting inbound");
                return;
            }
        };

        tokio::spawn(async move {
            if let Err(e) = socket.open(Connect::Accepted(Box::new(stream))).await {
                tracing::debug!(addr = %addr, error = %e, "Failed to open inbound socket");
            }
        });
        tracing::debug!(addr = %addr, "Accepted inbound");
    }

    /// Close every socket and wait for their loops to exit.
    async fn shutdown_sockets(&self) {
        tracing::info!(
            count = self.shared.registry.len(),
            "Shutting down peer connections"
        );

        self.shared.token.cancel();
        let sockets = self.shared.registry.close_all();

        // Wait for all socket loops to complete (with timeout)
        for socket in sockets {
            let _ = tokio::time::timeout(SOCKET_JOIN_TIMEOUT, socket.join()).await;
        }
    }
}

impl NodeShared {
    /// Open (or reuse) a connection to `addr`.
    ///
    /// An open inbound socket from that address is reused; otherwise the
    /// outbound pool is consulted and a fresh socket dialed on a miss.
    async fn dial(&self, addr: &str) -> P2pResult<Socket> {
        if self.token.is_cancelled() {
            return Err(P2pError::Shutdown);
        }

        if let Some(socket) = self.registry.inbound.find(addr) {
            if socket.is_open() {
                return Ok(socket);
            }
        }

        let (socket, existed) = self.registry.outbound.get(addr)?;
        let timeout = self.config.connect_timeout();
        let timed_out = || P2pError::ConnectionTimeout {
            addr: addr.to_string(),
        };

        if existed {
            tokio::time::timeout(timeout, socket.ready())
                .await
                .map_err(|_| timed_out())??;
        } else {
            let opened = tokio::time::timeout(
                timeout,
                socket.open(Connect::Dial(self.dialer.clone())),
            )
            .await;
            match opened {
                Ok(result) => result?,
                Err(_) => {
                    socket.close();
                    return Err(timed_out());
                }
            }
        }

        Ok(socket)
    }

    /// Socket a packet arrived on, for answering it.
    fn reply_socket(&self, addr: &str) -> P2pResult<Socket> {
        self.registry
            .inbound
            .find(addr)
            .or_else(|| self.registry.outbound.find(addr))
            .ok_or_else(|| P2pError::PeerNotFound(addr.to_string()))
    }

    /// Walk the tree from this node, sending each hop to its two targets.
    ///
    /// Both targets of a hop are contacted concurrently and must ack
    /// before the next level starts. The first failed hop aborts the walk.
    async fn rain(&self, is_root: bool, from_level: u32, template: &GossipMessage) -> P2pResult<()> {
        let peers = self.peers.sorted_peers();
        let hops = RainTree::new(&peers).hops(is_root, from_level);

        for hop in hops {
            self.send_hop(&hop, template).await?;
        }
        Ok(())
    }

    async fn send_hop(&self, hop: &Hop<Peer>, template: &GossipMessage) -> P2pResult<()> {
        let message = Message::Gossip(GossipMessage {
            level: hop.level,
            ..template.clone()
        });
        let body = Bytes::from(message.to_bytes()?);

        tracing::trace!(
            nonce = template.nonce,
            level = hop.level,
            left = %hop.left,
            right = %hop.right,
            "RainTree hop"
        );

        let (left, right) = tokio::join!(
            self.send_acked(&hop.left, body.clone(), template.nonce),
            self.send_acked(&hop.right, body, template.nonce),
        );
        left?;
        right
    }

    /// Deliver a gossip body to `peer` and wait for its ack. Sends to self are skipped.
    async fn send_acked(&self, peer: &Peer, body: Bytes, nonce: u64) -> P2pResult<()> {
        if peer.address == self.address {
            return Ok(());
        }

        let socket = self.dial(&peer.service_url).await?;
        let reply = socket.request(body, true).await?;

        match Message::from_bytes(&reply.data)? {
            Message::Ack(ack) if ack.nonce == nonce => {
                tracing::trace!(acker = %ack.acker, nonce, "Hop acknowledged");
                Ok(())
            }
            other => Err(P2pError::UnexpectedMessage {
                expected: "ack".to_string(),
                actual: other.name().to_string(),
            }),
        }
    }

    /// Best-effort unacknowledged copy to every other peer.
    async fn redundancy_pass(&self, template: &GossipMessage) {
        let message = Message::Gossip(GossipMessage {
            level: 0,
            broadcast: false,
            ..template.clone()
        });
        let body = match message.to_bytes() {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode redundant copy");
                return;
            }
        };

        for peer in self.peers.sorted_peers() {
            if peer.address == self.address {
                continue;
            }
            let sent = match self.dial(&peer.service_url).await {
                Ok(socket) => socket.write(body.clone(), false, 0, true),
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                tracing::debug!(peer = %peer, error = %e, "Redundant copy not sent");
            }
        }
    }

    async fn handle_envelope(&self, packet: Packet) {
        let message = match Message::from_bytes(&packet.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(addr = %packet.peer_addr, error = %e, "Dropping malformed envelope");
                return;
            }
        };

        let name = message.name();
        match message {
            Message::Gossip(gossip) => self.handle_gossip(&packet, gossip).await,
            Message::Ping(n) => {
                if packet.nonce == 0 {
                    return;
                }
                let reply = Message::Pong(n).to_bytes();
                let sent = reply.and_then(|body| {
                    self.reply_socket(&packet.peer_addr)?
                        .respond(packet.nonce, false, body, true)
                });
                if let Err(e) = sent {
                    tracing::debug!(addr = %packet.peer_addr, error = %e, "Failed to answer ping");
                }
            }
            Message::Ack(_) | Message::Pong(_) => {
                tracing::trace!(
                    addr = %packet.peer_addr,
                    kind = name,
                    "Reply arrived after its request gave up"
                );
            }
        }
    }

    async fn handle_gossip(&self, packet: &Packet, gossip: GossipMessage) {
        if packet.nonce != 0 {
            let ack = Message::Ack(AckMessage {
                acker: self.address.clone(),
                nonce: gossip.nonce,
            });
            let sent = ack.to_bytes().and_then(|body| {
                self.reply_socket(&packet.peer_addr)?
                    .respond(packet.nonce, false, body, true)
            });
            if let Err(e) = sent {
                tracing::debug!(addr = %packet.peer_addr, error = %e, "Failed to ack gossip");
            }
        }

        let relay = gossip.broadcast && gossip.level > 0 && gossip.source != self.address;
        if relay && self.gossip.first_relay(gossip.nonce, gossip.level) {
            if let Err(e) = self.rain(false, gossip.level, &gossip).await {
                tracing::debug!(
                    nonce = gossip.nonce,
                    level = gossip.level,
                    error = %e,
                    "Relay failed"
                );
            }
        }

        if self.gossip.first_delivery(gossip.nonce) {
            tracing::debug!(
                source = %gossip.source,
                nonce = gossip.nonce,
                len = gossip.payload.len(),
                "Broadcast delivered"
            );
            self.deliver(InboundMessage::broadcast(
                &gossip.source,
                gossip.nonce,
                gossip.payload,
            ))
            .await;
        }
    }

    /// Hand a message to the application, waiting for inbox space until shutdown.
    async fn deliver(&self, message: InboundMessage) {
        let inbox = self.inbox_tx.read().clone();
        let Some(tx) = inbox else {
            tracing::trace!(from = %message.from, "No inbox, dropping message");
            return;
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                tracing::debug!("Shutting down, dropping undelivered message");
            }
            sent = tx.send(message) => {
                if sent.is_err() {
                    tracing::debug!("Inbox receiver dropped");
                }
            }
        }
    }

    /// Hand a message to the application without waiting. Dropped if the inbox is full.
    fn try_deliver(&self, message: InboundMessage) {
        let inbox = self.inbox_tx.read().clone();
        let Some(tx) = inbox else {
            tracing::trace!(from = %message.from, "No inbox, dropping message");
            return;
        };

        match tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                tracing::warn!(
                    from = %message.from,
                    nonce = message.nonce,
                    len = message.payload.len(),
                    "Inbox full, dropping message"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Inbox receiver dropped");
            }
        }
    }
}

/// Cloneable handle for issuing operations against a node.
#[derive(Clone)]
pub struct P2pHandle {
    shared: Arc<NodeShared>,
}

impl std::fmt::Debug for P2pHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2pHandle")
            .field("address", &self.shared.address)
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}

impl P2pHandle {
    /// This node's address.
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// Broadcast `payload` to the whole network, returning its nonce.
    ///
    /// Fails if a hop of our own descent fails. Failures deeper in the tree
    /// are only logged by the relaying nodes.
    pub async fn broadcast(&self, payload: impl Into<Bytes>) -> P2pResult<u64> {
        let shared = &self.shared;
        let nonce = loop {
            let n = rand::random::<u64>();
            if n != 0 {
                break n;
            }
        };
        shared.gossip.mark_originated(nonce);

        let payload: Bytes = payload.into();
        let template = GossipMessage {
            nonce,
            level: 0,
            broadcast: true,
            source: shared.address.clone(),
            payload: payload.to_vec(),
        };

        tracing::debug!(nonce, len = payload.len(), "Broadcasting");
        let descent = shared.rain(true, 0, &template).await;

        if shared.config.redundancy {
            shared.redundancy_pass(&template).await;
        }

        descent.map(|_| nonce)
    }

    /// Fire-and-forget `payload` to the peer listening at `addr`.
    pub async fn send(&self, addr: &str, payload: impl Into<Bytes>) -> P2pResult<()> {
        let socket = self.shared.dial(addr).await?;
        socket.write(payload, false, 0, false)
    }

    /// Fire-and-forget `payload` to a known peer.
    pub async fn send_to(&self, address: &Address, payload: impl Into<Bytes>) -> P2pResult<()> {
        let peer = self
            .shared
            .peers
            .get_peer(address)
            .ok_or_else(|| P2pError::PeerNotFound(address.to_string()))?;
        self.send(&peer.service_url, payload).await
    }

    /// Send `payload` to `addr` and wait for the peer's `respond`.
    pub async fn request(&self, addr: &str, payload: impl Into<Bytes>) -> P2pResult<Bytes> {
        let socket = self.shared.dial(addr).await?;
        let reply = socket.request(payload, false).await?;
        Ok(reply.data)
    }

    /// Answer a direct message that carried a nonce.
    pub fn respond(
        &self,
        nonce: u32,
        is_error: bool,
        addr: &str,
        payload: impl Into<Bytes>,
    ) -> P2pResult<()> {
        self.shared
            .reply_socket(addr)?
            .respond(nonce, is_error, payload, false)
    }

    /// Round-trip time to the peer at `addr`.
    pub async fn ping(&self, addr: &str) -> P2pResult<Duration> {
        let socket = self.shared.dial(addr).await?;
        let n = rand::random::<u64>();
        let body = Message::Ping(n).to_bytes()?;

        let start = Instant::now();
        let reply = socket.request(body, true).await?;
        let rtt = start.elapsed();

        match Message::from_bytes(&reply.data)? {
            Message::Pong(m) if m == n => {
                tracing::trace!(addr, rtt = ?rtt, "Pong");
                Ok(rtt)
            }
            other => Err(P2pError::UnexpectedMessage {
                expected: "pong".to_string(),
                actual: other.name().to_string(),
            }),
        }
    }

    /// Add or replace a peer in the view.
    pub async fn add_peer(&self, peer: Peer) -> P2pResult<()> {
        self.shared.peers.add_peer(peer).await
    }

    /// Remove a peer from the view.
    pub async fn remove_peer(&self, address: Address) -> P2pResult<()> {
        self.shared.peers.remove_peer(address).await
    }

    /// Replace the peer set with `validators`, applying only the difference.
    ///
    /// Returns the number of peers added and removed.
    pub async fn update_validator_set(&self, validators: Vec<Peer>) -> P2pResult<(usize, usize)> {
        let current = self.shared.peers.peer_list();
        let (added, removed) = delta(&current, &validators);

        // Same address, new service URL.
        let moved: Vec<Peer> = validators
            .iter()
            .filter(|p| {
                current
                    .iter()
                    .any(|c| c.address == p.address && c.service_url != p.service_url)
            })
            .cloned()
            .collect();

        for peer in &removed {
            self.shared.peers.remove_peer(peer.address.clone()).await?;
        }
        for peer in added.iter().chain(moved.iter()) {
            self.shared.peers.add_peer(peer.clone()).await?;
        }

        tracing::info!(
            added = added.len(),
            removed = removed.len(),
            moved = moved.len(),
            total = self.shared.peers.len(),
            "Validator set updated"
        );
        Ok((added.len(), removed.len()))
    }

    /// Peers in self-anchored sorted order.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.sorted_peers()
    }

    /// Number of (inbound, outbound) registered connections.
    pub fn connection_counts(&self) -> (usize, usize) {
        (
            self.shared.registry.inbound.len(),
            self.shared.registry.outbound.len(),
        )
    }

    /// Stop the node: every socket closes and `run` returns.
    pub fn shutdown(&self) {
        self.shared.token.cancel();
    }
}
