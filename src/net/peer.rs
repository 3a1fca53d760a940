//! Per-peer protocol state machines over a shared async runtime.
//!
//! Each peer gets a reader task and a writer task; the writer drains a
//! bounded queue, and a peer that lets its queue fill is disconnected
//! (backpressure). The event loop owns all peer state, the address
//! manager, and the ban list; protocol violations disconnect and ban.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::{AcceptOutcome, ChainError, ChainState};
use crate::constants::*;
use crate::error::NetError;
use crate::mempool::Mempool;
use crate::net::addrman::AddrManager;
use crate::net::message::{
    self, decode_frame_header, decode_frame_payload, encode_frame, FrameHeader, GetBlocksMessage,
    InvItem, Message, NetAddress, VersionMessage, FRAME_HEADER_SIZE, INV_BLOCK, INV_TX,
};
use crate::store::KvStore;
use crate::types::Hash;

pub type PeerId = u64;

/// Handshake progression of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connected,
    VersionSent,
    VersionReceived,
    Ready,
    Disconnected,
}

/// Pure handshake state machine, independent of sockets so the
/// transitions are testable.
#[derive(Debug)]
pub struct Handshake {
    pub state: PeerState,
    outbound: bool,
    sent_version: bool,
    got_version: bool,
    got_verack: bool,
}

impl Handshake {
    pub fn new(outbound: bool) -> Self {
        Handshake {
            state: PeerState::Connected,
            outbound,
            sent_version: false,
            got_version: false,
            got_verack: false,
        }
    }

    /// Our `version` went out (on connect for outbound, after theirs for
    /// inbound).
    pub fn version_sent(&mut self) {
        self.sent_version = true;
        if self.state == PeerState::Connected {
            self.state = PeerState::VersionSent;
        }
    }

    /// Their `version` arrived. Returns what to send back: our own
    /// `version` first if we have not announced yet, then a `verack`.
    pub fn on_version(&mut self) -> Result<HandshakeReplies, NetError> {
        if self.got_version {
            return Err(NetError::ProtocolViolation("duplicate version".into()));
        }
        self.got_version = true;
        if self.state == PeerState::Connected || self.state == PeerState::VersionSent {
            self.state = PeerState::VersionReceived;
        }
        let send_version = !self.outbound && !self.sent_version;
        self.advance();
        Ok(HandshakeReplies { send_version, send_verack: true })
    }

    /// Their `verack` arrived.
    pub fn on_verack(&mut self) -> Result<(), NetError> {
        if self.got_verack {
            return Err(NetError::ProtocolViolation("duplicate verack".into()));
        }
        if !self.sent_version {
            return Err(NetError::ProtocolViolation("verack before version".into()));
        }
        self.got_verack = true;
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        if self.got_version && self.got_verack && self.state != PeerState::Ready {
            self.state = PeerState::Ready;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == PeerState::Ready
    }
}

/// What the handshake layer wants sent in response to a `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReplies {
    pub send_version: bool,
    pub send_verack: bool,
}

/// Commands from the rest of the node into the network loop.
#[derive(Debug)]
pub enum NetCommand {
    Connect(SocketAddr),
    AnnounceBlock(Hash),
    AnnounceTx(Hash),
    PeerCount(oneshot::Sender<usize>),
}

/// Network layer configuration.
#[derive(Clone)]
pub struct NetConfig {
    pub magic: [u8; 4],
    pub listen_port: u16,
    pub user_agent: String,
    pub max_connections: usize,
    pub seeds: Vec<SocketAddr>,
}

struct PeerConn {
    addr: SocketAddr,
    outbound: bool,
    handshake: Handshake,
    msg_tx: mpsc::Sender<Message>,
    last_recv: Instant,
    last_send: Instant,
    /// Objects this peer is known to have, to suppress echo relays.
    known_inv: HashSet<Hash>,
    version: Option<VersionMessage>,
    /// Has this peer been counted in the ready-peer total?
    counted: bool,
}

impl PeerConn {
    /// Queue a message; a full queue is fatal for the peer.
    fn send(&mut self, message: Message) -> Result<(), NetError> {
        self.msg_tx.try_send(message).map_err(|_| NetError::SendQueueFull)?;
        self.last_send = Instant::now();
        Ok(())
    }
}

enum InternalEvent {
    Incoming { id: PeerId, message: Box<Message> },
    ReadError { id: PeerId, error: NetError },
    Closed { id: PeerId },
}

/// Everything the network loop operates on.
pub struct NetContext {
    pub config: NetConfig,
    pub chain: Arc<RwLock<ChainState>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub store: Arc<dyn KvStore>,
    pub peer_count: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
}

/// Start the network layer: binds the listener, spawns the event loop,
/// and returns the bound address plus the command handle.
pub async fn start(
    ctx: NetContext,
) -> Result<(SocketAddr, mpsc::Sender<NetCommand>, tokio::task::JoinHandle<()>), NetError> {
    let listener =
        TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], ctx.config.listen_port))).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "listening for peers");
    let (command_tx, command_rx) = mpsc::channel(256);
    let seeds = ctx.config.seeds.clone();
    let command_tx_clone = command_tx.clone();
    let handle = tokio::spawn(async move {
        for seed in seeds {
            let _ = command_tx_clone.send(NetCommand::Connect(seed)).await;
        }
        net_loop(ctx, listener, command_rx).await;
    });
    Ok((local_addr, command_tx, handle))
}

async fn net_loop(
    ctx: NetContext,
    listener: TcpListener,
    mut command_rx: mpsc::Receiver<NetCommand>,
) {
    let mut peers: HashMap<PeerId, PeerConn> = HashMap::new();
    let mut banned: HashMap<IpAddr, Instant> = HashMap::new();
    let mut addrman = AddrManager::load(&*ctx.store);
    let (internal_tx, mut internal_rx) = mpsc::channel::<InternalEvent>(1024);
    let mut next_id: PeerId = 0;
    let mut sweep = tokio::time::interval(Duration::from_secs(5));
    let mut dial = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,

            accepted = listener.accept() => {
                let Ok((stream, addr)) = accepted else { continue };
                if is_banned(&mut banned, &addr.ip()) {
                    tracing::debug!(%addr, "refused banned peer");
                    continue;
                }
                if peers.len() >= ctx.config.max_connections {
                    continue;
                }
                next_id += 1;
                spawn_peer(&ctx, &mut peers, &internal_tx, next_id, stream, addr, false);
            }

            Some(command) = command_rx.recv() => match command {
                NetCommand::Connect(addr) => {
                    if is_banned(&mut banned, &addr.ip()) || peers.values().any(|p| p.addr == addr) {
                        continue;
                    }
                    match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => {
                            next_id += 1;
                            spawn_peer(&ctx, &mut peers, &internal_tx, next_id, stream, addr, true);
                            addrman.record_success(&addr, message::unix_time());
                        }
                        _ => {
                            tracing::debug!(%addr, "outbound connect failed");
                            addrman.record_failure(&addr);
                        }
                    }
                }
                NetCommand::AnnounceBlock(hash) => {
                    relay_inv(&mut peers, &ctx.peer_count, InvItem::block(hash), None);
                }
                NetCommand::AnnounceTx(hash) => {
                    relay_inv(&mut peers, &ctx.peer_count, InvItem::tx(hash), None);
                }
                NetCommand::PeerCount(reply) => {
                    let _ = reply.send(peers.values().filter(|p| p.handshake.is_ready()).count());
                }
            },

            Some(event) = internal_rx.recv() => match event {
                InternalEvent::Incoming { id, message } => {
                    match handle_message(&ctx, &mut peers, &mut addrman, id, *message).await {
                        Ok(()) => {}
                        // Backpressure is a disconnect, not an offence.
                        Err(NetError::SendQueueFull) => drop_peer(&ctx, &mut peers, id),
                        Err(error) => punish(&ctx, &mut peers, &mut banned, id, &error),
                    }
                }
                InternalEvent::ReadError { id, error } => {
                    punish(&ctx, &mut peers, &mut banned, id, &error);
                }
                InternalEvent::Closed { id } => {
                    drop_peer(&ctx, &mut peers, id);
                }
            },

            _ = sweep.tick() => {
                sweep_peers(&ctx, &mut peers);
                ctx.mempool.write().await.evict_expired_orphans(message::unix_time());
            }

            _ = dial.tick() => {
                let outbound = peers.values().filter(|p| p.outbound).count();
                if outbound < 8 && peers.len() < ctx.config.max_connections {
                    let connected: Vec<SocketAddr> = peers.values().map(|p| p.addr).collect();
                    if let Some(addr) = addrman.sample(|a| connected.contains(a)) {
                        next_id += 1;
                        match tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr)).await {
                            Ok(Ok(stream)) => spawn_peer(&ctx, &mut peers, &internal_tx, next_id, stream, addr, true),
                            _ => addrman.record_failure(&addr),
                        }
                    }
                }
            }
        }
    }

    addrman.persist(&*ctx.store);
    ctx.peer_count.store(0, Ordering::Relaxed);
    tracing::info!("network loop stopped");
}

fn is_banned(banned: &mut HashMap<IpAddr, Instant>, ip: &IpAddr) -> bool {
    match banned.get(ip) {
        Some(until) if Instant::now() < *until => true,
        Some(_) => {
            banned.remove(ip);
            false
        }
        None => false,
    }
}

fn spawn_peer(
    ctx: &NetContext,
    peers: &mut HashMap<PeerId, PeerConn>,
    internal_tx: &mpsc::Sender<InternalEvent>,
    id: PeerId,
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
) {
    let (read_half, write_half) = stream.into_split();
    let (msg_tx, msg_rx) = mpsc::channel::<Message>(SEND_QUEUE_DEPTH);

    let magic = ctx.config.magic;
    tokio::spawn(writer_task(write_half, msg_rx, magic));
    tokio::spawn(reader_task(read_half, internal_tx.clone(), id, magic, ctx.shutdown.clone()));

    let mut conn = PeerConn {
        addr,
        outbound,
        handshake: Handshake::new(outbound),
        msg_tx,
        last_recv: Instant::now(),
        last_send: Instant::now(),
        known_inv: HashSet::new(),
        version: None,
        counted: false,
    };
    if outbound {
        let version = our_version(ctx, addr);
        if conn.send(Message::Version(version)).is_ok() {
            conn.handshake.version_sent();
        }
    }
    tracing::debug!(%addr, outbound, "peer connected");
    peers.insert(id, conn);
}

fn our_version(ctx: &NetContext, remote: SocketAddr) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: 1,
        timestamp: message::unix_time(),
        addr_recv: NetAddress::from_socket(remote, 1),
        addr_from: NetAddress::from_socket(
            SocketAddr::from(([0, 0, 0, 0], ctx.config.listen_port)),
            1,
        ),
        nonce: rand::random(),
        user_agent: ctx.config.user_agent.clone(),
        start_height: 0,
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    mut msg_rx: mpsc::Receiver<Message>,
    magic: [u8; 4],
) {
    while let Some(message) = msg_rx.recv().await {
        let frame = encode_frame(magic, &message);
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn reader_task(
    mut read_half: OwnedReadHalf,
    internal_tx: mpsc::Sender<InternalEvent>,
    id: PeerId,
    magic: [u8; 4],
    shutdown: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = read_one_frame(&mut read_half, magic) => r,
        };
        match result {
            Ok(message) => {
                if internal_tx
                    .send(InternalEvent::Incoming { id, message: Box::new(message) })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(NetError::ConnectionClosed) => break,
            Err(error) => {
                let _ = internal_tx.send(InternalEvent::ReadError { id, error }).await;
                return;
            }
        }
    }
    let _ = internal_tx.send(InternalEvent::Closed { id }).await;
}

async fn read_one_frame(read_half: &mut OwnedReadHalf, magic: [u8; 4]) -> Result<Message, NetError> {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    if read_half.read_exact(&mut header_bytes).await.is_err() {
        return Err(NetError::ConnectionClosed);
    }
    let header: FrameHeader = decode_frame_header(&header_bytes, magic)?;
    let mut payload = vec![0u8; header.payload_len];
    if read_half.read_exact(&mut payload).await.is_err() {
        return Err(NetError::ConnectionClosed);
    }
    decode_frame_payload(&header, &payload)
}

fn drop_peer(ctx: &NetContext, peers: &mut HashMap<PeerId, PeerConn>, id: PeerId) {
    if let Some(conn) = peers.remove(&id) {
        if conn.counted {
            ctx.peer_count.fetch_sub(1, Ordering::Relaxed);
        }
        tracing::debug!(addr = %conn.addr, "peer disconnected");
    }
}

fn punish(
    ctx: &NetContext,
    peers: &mut HashMap<PeerId, PeerConn>,
    banned: &mut HashMap<IpAddr, Instant>,
    id: PeerId,
    error: &NetError,
) {
    if let Some(conn) = peers.get(&id) {
        tracing::warn!(addr = %conn.addr, "banning peer: {error}");
        banned.insert(conn.addr.ip(), Instant::now() + Duration::from_secs(BAN_DURATION_SECS));
    }
    drop_peer(ctx, peers, id);
}

fn sweep_peers(ctx: &NetContext, peers: &mut HashMap<PeerId, PeerConn>) {
    let now = Instant::now();
    let mut stale = Vec::new();
    for (&id, conn) in peers.iter_mut() {
        if now.duration_since(conn.last_recv).as_secs() > PEER_TIMEOUT_SECS {
            stale.push(id);
            continue;
        }
        if conn.handshake.is_ready()
            && now.duration_since(conn.last_send).as_secs() > PING_INTERVAL_SECS
            && conn.send(Message::Ping(rand::random())).is_err()
        {
            stale.push(id);
        }
    }
    for id in stale {
        tracing::debug!("dropping silent peer");
        drop_peer(ctx, peers, id);
    }
}

fn relay_inv(
    peers: &mut HashMap<PeerId, PeerConn>,
    peer_count: &Arc<AtomicUsize>,
    item: InvItem,
    exclude: Option<PeerId>,
) {
    let mut dead = Vec::new();
    for (&id, conn) in peers.iter_mut() {
        if Some(id) == exclude || !conn.handshake.is_ready() {
            continue;
        }
        if conn.known_inv.contains(&item.hash) {
            continue;
        }
        if conn.send(Message::Inv(vec![item])).is_err() {
            dead.push(id);
        } else {
            conn.known_inv.insert(item.hash);
        }
    }
    for id in dead {
        if let Some(conn) = peers.remove(&id) {
            if conn.counted {
                peer_count.fetch_sub(1, Ordering::Relaxed);
            }
            tracing::debug!(addr = %conn.addr, "dropped peer on full send queue");
        }
    }
}

/// Dispatch one message from `id`. Errors bubbling out of here ban the
/// peer.
async fn handle_message(
    ctx: &NetContext,
    peers: &mut HashMap<PeerId, PeerConn>,
    addrman: &mut AddrManager,
    id: PeerId,
    message: Message,
) -> Result<(), NetError> {
    let Some(conn) = peers.get_mut(&id) else {
        return Ok(());
    };
    conn.last_recv = Instant::now();

    match message {
        Message::Version(version) => {
            if version.version < MIN_PROTO_VERSION {
                return Err(NetError::ProtocolViolation("obsolete protocol version".into()));
            }
            let replies = conn.handshake.on_version()?;
            conn.version = Some(version);
            if replies.send_version {
                let ours = our_version(ctx, conn.addr);
                conn.send(Message::Version(ours))?;
                conn.handshake.version_sent();
            }
            if replies.send_verack {
                conn.send(Message::Verack)?;
            }
            finish_ready(ctx, peers, id).await;
        }
        Message::Verack => {
            conn.handshake.on_verack()?;
            finish_ready(ctx, peers, id).await;
        }
        other => {
            if !conn.handshake.is_ready() {
                return Err(NetError::ProtocolViolation(format!(
                    "{} before handshake completed",
                    other.command()
                )));
            }
            handle_ready_message(ctx, peers, addrman, id, other).await?;
        }
    }
    Ok(())
}

/// On becoming ready: bump the peer counter and ask for their chain.
async fn finish_ready(ctx: &NetContext, peers: &mut HashMap<PeerId, PeerConn>, id: PeerId) {
    let locator = ctx.chain.read().await.locator();
    let Some(conn) = peers.get_mut(&id) else { return };
    if !conn.handshake.is_ready() || conn.version.is_none() || conn.counted {
        return;
    }
    conn.counted = true;
    ctx.peer_count.fetch_add(1, Ordering::Relaxed);
    tracing::info!(addr = %conn.addr, "peer ready");
    let _ = conn.send(Message::GetBlocks(GetBlocksMessage {
        version: PROTOCOL_VERSION,
        locator,
        hash_stop: [0u8; 32],
    }));
}

async fn handle_ready_message(
    ctx: &NetContext,
    peers: &mut HashMap<PeerId, PeerConn>,
    addrman: &mut AddrManager,
    id: PeerId,
    message: Message,
) -> Result<(), NetError> {
    match message {
        Message::Ping(nonce) => {
            if let Some(conn) = peers.get_mut(&id) {
                conn.send(Message::Pong(nonce))?;
            }
        }
        Message::Pong(_) => {}

        Message::Addr(addresses) => {
            if addresses.len() > 1000 {
                return Err(NetError::ProtocolViolation("oversized addr gossip".into()));
            }
            for stamped in addresses {
                addrman.add(stamped.address, stamped.last_seen as u64);
            }
        }

        Message::Inv(items) => {
            if items.len() > 50_000 {
                return Err(NetError::ProtocolViolation("oversized inv".into()));
            }
            let mut wanted = Vec::new();
            {
                let chain = ctx.chain.read().await;
                let mempool = ctx.mempool.read().await;
                for item in &items {
                    let known = match item.kind {
                        INV_BLOCK => chain.knows_block(&item.hash),
                        INV_TX => mempool.contains(&item.hash),
                        _ => return Err(NetError::ProtocolViolation("unknown inv type".into())),
                    };
                    if !known {
                        wanted.push(*item);
                    }
                }
            }
            if let Some(conn) = peers.get_mut(&id) {
                for item in &items {
                    conn.known_inv.insert(item.hash);
                }
                if !wanted.is_empty() {
                    conn.send(Message::GetData(wanted))?;
                }
            }
        }

        Message::GetData(items) => {
            if items.len() > 50_000 {
                return Err(NetError::ProtocolViolation("oversized getdata".into()));
            }
            let mut replies = Vec::new();
            {
                let chain = ctx.chain.read().await;
                let mempool = ctx.mempool.read().await;
                for item in items {
                    match item.kind {
                        INV_BLOCK => {
                            if let Some(block) = chain.get_block(&item.hash) {
                                replies.push(Message::Block(block));
                            }
                        }
                        INV_TX => {
                            if let Some(entry) = mempool.get(&item.hash) {
                                replies.push(Message::Tx(entry.tx.clone()));
                            }
                        }
                        _ => return Err(NetError::ProtocolViolation("unknown inv type".into())),
                    }
                }
            }
            if let Some(conn) = peers.get_mut(&id) {
                for reply in replies {
                    conn.send(reply)?;
                }
            }
        }

        Message::GetBlocks(request) => {
            let hashes = ctx
                .chain
                .read()
                .await
                .hashes_from_locator(&request.locator, &request.hash_stop, 500);
            if let Some(conn) = peers.get_mut(&id) {
                if !hashes.is_empty() {
                    conn.send(Message::Inv(hashes.into_iter().map(InvItem::block).collect()))?;
                }
            }
        }

        Message::GetHeaders(request) => {
            let headers = ctx
                .chain
                .read()
                .await
                .headers_from_locator(&request.locator, &request.hash_stop, 2000);
            if let Some(conn) = peers.get_mut(&id) {
                conn.send(Message::Headers(headers))?;
            }
        }

        Message::Headers(headers) => {
            if headers.len() > 2000 {
                return Err(NetError::ProtocolViolation("oversized headers".into()));
            }
            let mut wanted = Vec::new();
            {
                let chain = ctx.chain.read().await;
                for header in &headers {
                    let hash = header.hash();
                    if !chain.knows_block(&hash) {
                        wanted.push(InvItem::block(hash));
                    }
                }
            }
            if let Some(conn) = peers.get_mut(&id) {
                if !wanted.is_empty() {
                    conn.send(Message::GetData(wanted))?;
                }
            }
        }

        Message::Tx(tx) => {
            let hash = tx.hash();
            let accepted = {
                let chain = ctx.chain.read().await;
                let mut mempool = ctx.mempool.write().await;
                mempool.accept(tx, &chain, message::unix_time())
            };
            match accepted {
                Ok(admitted) => {
                    if let Some(conn) = peers.get_mut(&id) {
                        conn.known_inv.insert(hash);
                    }
                    for admitted_hash in admitted {
                        relay_inv(peers, &ctx.peer_count, InvItem::tx(admitted_hash), Some(id));
                    }
                }
                Err(crate::error::MempoolError::Consensus(err)) => {
                    return Err(NetError::ProtocolViolation(format!("invalid tx: {err}")));
                }
                Err(crate::error::MempoolError::Script(err)) => {
                    return Err(NetError::ProtocolViolation(format!("invalid tx script: {err}")));
                }
                Err(err) => {
                    tracing::debug!(hash = %hex::encode(hash), "tx not admitted: {err}");
                }
            }
        }

        Message::Block(block) => {
            let hash = block.hash();
            if let Some(conn) = peers.get_mut(&id) {
                conn.known_inv.insert(hash);
            }
            let outcome = ctx.chain.write().await.accept_block(block.clone(), message::unix_time());
            match outcome {
                Ok(AcceptOutcome::Connected { disconnected }) => {
                    {
                        let chain = ctx.chain.read().await;
                        let mut mempool = ctx.mempool.write().await;
                        mempool.remove_for_block(&block);
                        mempool.readmit(disconnected, &chain, message::unix_time());
                    }
                    relay_inv(peers, &ctx.peer_count, InvItem::block(hash), Some(id));
                }
                Ok(AcceptOutcome::OrphanParent) => {
                    let locator = ctx.chain.read().await.locator();
                    if let Some(conn) = peers.get_mut(&id) {
                        conn.send(Message::GetBlocks(GetBlocksMessage {
                            version: PROTOCOL_VERSION,
                            locator,
                            hash_stop: [0u8; 32],
                        }))?;
                    }
                }
                Ok(AcceptOutcome::SideChain | AcceptOutcome::Duplicate) => {}
                Err(ChainError::Rejected { error, punish }) => {
                    if punish {
                        return Err(NetError::ProtocolViolation(format!("invalid block: {error}")));
                    }
                    tracing::debug!(hash = %hex::encode(hash), "block not accepted: {error}");
                }
                Err(ChainError::Store(err)) => {
                    // Persistence is gone; the orchestrator turns this
                    // into a shutdown.
                    tracing::error!("store failure while connecting block: {err}");
                    ctx.shutdown.cancel();
                }
            }
        }

        Message::Version(_) | Message::Verack => unreachable!("handled by caller"),
    }
    Ok(())
}
