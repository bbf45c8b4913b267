//! The virtual server: shared state, its tasks and their queues.
//!
//! Each virtual server owns a channel tree, a user registry, the live
//! client map and one listening port speaking both TLS (control) and UDP
//! (voice). All mutations of the shared state go through the single router
//! task consuming the incoming queue, so handlers never race each other;
//! voice dispatch and the UDP demultiplexer only ever take read locks.

pub mod acl;
pub mod ban;
pub mod bandwidth;
pub mod blobstore;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod freeze;
pub mod handlers;
pub mod lock;
pub mod ratelimit;
pub mod target;
pub mod tls;
pub mod user;

use bytes::BytesMut;
use futures::StreamExt;
use openssl::ssl::Ssl;
use openssl::ssl::SslAcceptor;
use std::collections::HashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio_openssl::SslStream;
use tokio_util::codec::Framed;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::control::ControlCodec;
use crate::control::ControlPacket;
use crate::crypt::CryptState;
use crate::msgs;
use crate::ping::PingPacket;
use crate::ping::PongPacket;
use crate::server::ban::Ban;
use crate::server::blobstore::BlobStore;
use crate::server::broadcast::VoiceBroadcast;
use crate::server::channel::ChannelTree;
use crate::server::client::Client;
use crate::server::client::ClientState;
use crate::server::client::ClientVersion;
use crate::server::config::Config;
use crate::server::user::UserRegistry;

/// Codec id of CELT 0.7.0.
pub const CELT_ALPHA: i32 = 0x8000_000bu32 as i32;
/// Codec id of CELT 0.11.0.
pub const CELT_BETA: i32 = 0x8000_0010u32 as i32;

/// Depth of the incoming control-message queue.
const INCOMING_QUEUE_DEPTH: usize = 256;
/// Depth of the voice broadcast queue.
const VOICE_QUEUE_DEPTH: usize = 1024;
/// Seconds between snapshot attempts when there are unsaved changes.
const FREEZE_INTERVAL_SECS: u64 = 60;

/// A control message pulled off a client's reliable channel, queued for the
/// router.
pub struct Message {
    pub client: Arc<Client>,
    pub packet: ControlPacket,
}

impl Message {
    pub fn new(client: Arc<Client>, packet: ControlPacket) -> Self {
        Message { client, packet }
    }
}

/// Allocates session ids: monotonically increasing, ids are reused only
/// after the 32-bit counter rolls over, and never while still live.
#[derive(Debug)]
pub struct SessionPool {
    next: u32,
    used: HashSet<u32>,
}

impl Default for SessionPool {
    fn default() -> Self {
        SessionPool {
            // Session 0 is never handed out; serverbound audio encodes the
            // absence of a session as 0.
            next: 1,
            used: HashSet::new(),
        }
    }
}

impl SessionPool {
    pub fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next;
            self.next = match self.next.checked_add(1) {
                Some(next) => next,
                None => 1,
            };
            if id != 0 && self.used.insert(id) {
                return id;
            }
        }
    }

    pub fn release(&mut self, id: u32) {
        self.used.remove(&id);
    }
}

/// The aggregate codec preference of the connected clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodecState {
    pub alpha: i32,
    pub beta: i32,
    pub prefer_alpha: bool,
    pub opus: bool,
}

impl Default for CodecState {
    fn default() -> Self {
        CodecState {
            alpha: CELT_ALPHA,
            beta: CELT_BETA,
            prefer_alpha: true,
            opus: true,
        }
    }
}

/// Shared mutable state of a virtual server. Written by the router task
/// only; read by voice dispatch and the UDP demultiplexer.
pub struct State {
    pub channels: ChannelTree,
    pub clients: HashMap<u32, Arc<Client>>,
    /// Source address to session, for the UDP demultiplexer.
    pub udp_index: HashMap<SocketAddr, u32>,
    pub users: UserRegistry,
    pub bans: Vec<Ban>,
    pub codec: CodecState,
}

impl Default for State {
    fn default() -> Self {
        State {
            channels: ChannelTree::new(),
            clients: HashMap::new(),
            udp_index: HashMap::new(),
            users: UserRegistry::new(),
            bans: Vec::new(),
            codec: CodecState::default(),
        }
    }
}

impl State {
    /// Clients that completed the handshake.
    pub fn ready_clients(&self) -> impl Iterator<Item = &Arc<Client>> {
        self.clients
            .values()
            .filter(|c| c.state() == ClientState::Ready)
    }

    /// Queues a message for every ready client.
    pub fn broadcast(&self, packet: &ControlPacket) {
        for client in self.ready_clients() {
            client.send_message(packet.clone());
        }
    }

    /// Queues a message for every ready client in one channel.
    pub fn broadcast_channel(&self, channel: u32, packet: &ControlPacket) {
        if let Some(channel) = self.channels.get(channel) {
            for session in &channel.members {
                if let Some(client) = self.clients.get(session) {
                    if client.state() == ClientState::Ready {
                        client.send_message(packet.clone());
                    }
                }
            }
        }
    }

    /// Invalidate every materialized voice-target listener set. Called
    /// after any mutation that could change a resolution.
    pub fn clear_caches(&self) {
        for client in self.clients.values() {
            let mut targets = client.targets.lock().unwrap();
            for (_, target) in targets.iter_mut() {
                target.clear_cache();
            }
        }
    }
}

/// One virtual server.
pub struct Server {
    pub id: u64,
    version: ClientVersion,
    cfg: StdMutex<Config>,
    data_dir: PathBuf,
    pub blobstore: BlobStore,

    pub state: RwLock<State>,
    session_pool: StdMutex<SessionPool>,

    incoming_tx: mpsc::Sender<Message>,
    incoming_rx: StdMutex<Option<mpsc::Receiver<Message>>>,
    voice_tx: mpsc::Sender<VoiceBroadcast>,
    voice_rx: StdMutex<Option<mpsc::Receiver<VoiceBroadcast>>>,

    udp_socket: OnceLock<Arc<UdpSocket>>,
    dirty: AtomicBool,
}

impl Server {
    /// Loads or creates the virtual server with the given id under
    /// `data_dir`. A left-over snapshot temp file from an interrupted
    /// freeze is removed; an existing snapshot is applied.
    pub fn new(id: u64, data_dir: &Path) -> anyhow::Result<Arc<Server>> {
        let server_dir = data_dir.join("servers").join(id.to_string());
        std::fs::create_dir_all(&server_dir)?;
        freeze::clean_orphans(&server_dir)?;

        let blobstore = BlobStore::open(&data_dir.join("blobs"))?;

        let mut cfg = Config::new();
        let mut state = State::default();
        if let Some(frozen) = freeze::read_snapshot(&server_dir)? {
            freeze::apply(&frozen, &mut state, &mut cfg);
            info!(
                server = id,
                channels = state.channels.dfs_order().len(),
                "thawed snapshot"
            );
        }

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE_DEPTH);
        let (voice_tx, voice_rx) = mpsc::channel(VOICE_QUEUE_DEPTH);
        Ok(Arc::new(Server {
            id,
            version: ClientVersion::new(1, 5, 0),
            cfg: StdMutex::new(cfg),
            data_dir: server_dir,
            blobstore,
            state: RwLock::new(state),
            session_pool: StdMutex::new(SessionPool::default()),
            incoming_tx,
            incoming_rx: StdMutex::new(Some(incoming_rx)),
            voice_tx,
            voice_rx: StdMutex::new(Some(voice_rx)),
            udp_socket: OnceLock::new(),
            dirty: AtomicBool::new(false),
        }))
    }

    #[cfg(test)]
    pub(crate) fn new_for_test() -> Arc<Server> {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        Server::new(1, &dir).expect("test server")
    }

    /// The protocol version this server speaks.
    pub fn version(&self) -> ClientVersion {
        self.version
    }

    pub fn cfg_int(&self, key: &str) -> i64 {
        self.cfg.lock().unwrap().int_value(key)
    }

    pub fn cfg_bool(&self, key: &str) -> bool {
        self.cfg.lock().unwrap().bool_value(key)
    }

    pub fn cfg_str(&self, key: &str) -> String {
        self.cfg.lock().unwrap().str_value(key)
    }

    /// Inbound voice budget per client, in bytes per second. The config
    /// key is in bits per second, as reported on the wire.
    pub fn max_bandwidth_bytes(&self) -> usize {
        (self.cfg_int("MaxBandwidth") / 8).max(0) as usize
    }

    pub fn udp_socket(&self) -> Option<&Arc<UdpSocket>> {
        self.udp_socket.get()
    }

    /// Marks the persistent state changed; the tick task freezes it soon.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn enqueue(&self, message: Message) {
        let _ = self.incoming_tx.send(message).await;
    }

    pub async fn enqueue_voice(&self, broadcast: VoiceBroadcast) {
        let _ = self.voice_tx.send(broadcast).await;
    }

    pub fn allocate_session(&self) -> u32 {
        self.session_pool.lock().unwrap().allocate()
    }

    /// Unindexes a disconnecting client. The disconnect logic on the
    /// client drives this exactly once.
    pub async fn remove_client(&self, client: &Arc<Client>, announce: bool) {
        let mut state = self.state.write().await;
        state.clients.remove(&client.session);
        state.udp_index.retain(|_, session| *session != client.session);
        let channel = client.channel_id();
        state.channels.member_leave(channel, client.session);
        state.clear_caches();

        // Kicks announce themselves with a reasoned UserRemove beforehand.
        if announce && !client.was_kicked() {
            let mut remove = msgs::UserRemove::new();
            remove.set_session(client.session);
            state.broadcast(&remove.into());
        }
        drop(state);

        self.session_pool.lock().unwrap().release(client.session);
        self.mark_dirty();
    }

    /// Recomputes the aggregate codec preference and announces it when it
    /// changed. Must be called without the state lock held.
    pub async fn update_codec_versions(&self, connecting: Option<&Arc<Client>>) {
        let opus_threshold = self.cfg_int("OpusThreshold");
        let mut state = self.state.write().await;

        let mut histogram: HashMap<i32, usize> = HashMap::new();
        let mut opus_capable = 0usize;
        let mut total = 0usize;
        for client in state.ready_clients().chain(connecting.into_iter()) {
            total += 1;
            let profile = client.profile.lock().unwrap();
            if profile.opus {
                opus_capable += 1;
            }
            for codec in &profile.celt_codecs {
                *histogram.entry(*codec).or_insert(0) += 1;
            }
        }

        let mut versions: Vec<(i32, usize)> = histogram.into_iter().collect();
        versions.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let new = CodecState {
            alpha: versions.first().map(|v| v.0).unwrap_or(CELT_ALPHA),
            beta: versions.get(1).map(|v| v.0).unwrap_or(CELT_BETA),
            prefer_alpha: true,
            opus: total == 0 || opus_capable * 100 >= total * opus_threshold as usize,
        };
        if new == state.codec {
            return;
        }
        state.codec = new;

        let mut msg = msgs::CodecVersion::new();
        msg.set_alpha(new.alpha);
        msg.set_beta(new.beta);
        msg.set_prefer_alpha(new.prefer_alpha);
        msg.set_opus(new.opus);
        info!(server = self.id, opus = new.opus, "codec preference changed");
        state.broadcast(&msg.into());
    }

    /// Writes a snapshot if anything changed since the last one. Failures
    /// are logged and retried on a later tick; the previous snapshot stays
    /// in place either way.
    pub async fn freeze_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let frozen = {
            let state = self.state.read().await;
            let cfg = self.cfg.lock().unwrap();
            freeze::snapshot(&state, &cfg)
        };
        if let Err(err) = freeze::write_snapshot(&self.data_dir, &frozen) {
            warn!(server = self.id, "snapshot failed, will retry: {}", err);
            self.dirty.store(true, Ordering::Release);
        } else {
            debug!(server = self.id, "snapshot written");
        }
    }

    /// Runs the virtual server on `addr` until the process exits.
    pub async fn run(self: Arc<Self>, acceptor: Arc<SslAcceptor>, addr: SocketAddr) -> anyhow::Result<()> {
        let tcp = TcpListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await?;
        let _ = self.udp_socket.set(Arc::new(udp));
        info!(server = self.id, %addr, "listening");

        let incoming_rx = self
            .incoming_rx
            .lock()
            .unwrap()
            .take()
            .expect("run called twice");
        let voice_rx = self.voice_rx.lock().unwrap().take().expect("run called twice");

        tokio::spawn(handlers::message_loop(self.clone(), incoming_rx));
        tokio::spawn(broadcast::voice_loop(self.clone(), voice_rx));
        tokio::spawn(Self::udp_reader(
            self.clone(),
            self.udp_socket().expect("socket just set").clone(),
        ));
        tokio::spawn(Self::tick_loop(self.clone()));

        loop {
            let (stream, remote) = match tcp.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(server = self.id, "accept failed: {}", err);
                    continue;
                }
            };
            debug!(server = self.id, %remote, "new connection");
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) = Self::handle_connection(server, acceptor, stream, remote).await {
                    debug!(%remote, "connection ended: {}", err);
                }
            });
        }
    }

    async fn handle_connection(
        server: Arc<Server>,
        acceptor: Arc<SslAcceptor>,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> anyhow::Result<()> {
        let ssl = Ssl::new(acceptor.context())?;
        let mut tls = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls).accept().await?;

        let (cert_hash, cert_verified) = tls::peer_identity(tls.ssl());

        let session = server.allocate_session();
        let (client, queues) = Client::new(session, &server, remote, CryptState::generate_new());
        {
            let mut profile = client.profile.lock().unwrap();
            profile.cert_hash = cert_hash;
            profile.cert_verified = cert_verified;
        }
        info!(session, %remote, "client connected");

        let framed = Framed::new(tls, ControlCodec::new());
        let (sink, stream) = framed.split();

        tokio::spawn(client::writer_loop(
            client.clone(),
            sink,
            queues.control_rx,
            queues.tunnel_rx,
        ));
        tokio::spawn(client::udp_loop(
            server.clone(),
            client.clone(),
            queues.udprecv_rx,
        ));
        client::recv_loop(server, client, stream).await;
        Ok(())
    }

    /// Single reader of the UDP socket: answers bare server-query pings
    /// and demultiplexes encrypted datagrams to their client by source
    /// address, probing same-host clients for unknown addresses.
    async fn udp_reader(server: Arc<Server>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; crate::voice::MAX_PACKET_SIZE + crate::crypt::OVERHEAD];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(server = server.id, "udp receive failed: {}", err);
                    continue;
                }
            };
            let data = &buf[..len];

            if let Ok(ping) = PingPacket::try_from(data) {
                let reply = server.pong(ping.id).await;
                let reply: [u8; 24] = reply.into();
                let _ = socket.try_send_to(&reply, addr);
                continue;
            }

            let known = {
                let state = server.state.read().await;
                state
                    .udp_index
                    .get(&addr)
                    .and_then(|session| state.clients.get(session))
                    .cloned()
            };

            match known {
                Some(client) => {
                    let mut plain = BytesMut::from(data);
                    let result = client.crypt.lock().unwrap().decrypt(&mut plain);
                    match result {
                        Ok(()) => {
                            client.set_udp_active(true);
                            client.queue_udp(plain);
                        }
                        Err(err) => {
                            debug!(session = client.session, "udp decrypt failed: {:?}", err);
                            client.maybe_request_crypt_resync();
                        }
                    }
                }
                None => {
                    server.probe_udp_source(addr, data).await;
                }
            }
        }
    }

    /// An unknown source address: find the client it belongs to by trying
    /// to decrypt with every client connected from the same host.
    async fn probe_udp_source(self: &Arc<Self>, addr: SocketAddr, data: &[u8]) {
        let candidates: Vec<Arc<Client>> = {
            let state = self.state.read().await;
            state
                .clients
                .values()
                .filter(|c| c.remote().ip() == addr.ip() && c.udp_addr().is_none())
                .cloned()
                .collect()
        };
        for client in candidates {
            let mut plain = BytesMut::from(data);
            let decrypted = client.crypt.lock().unwrap().decrypt(&mut plain).is_ok();
            if !decrypted {
                continue;
            }
            {
                let mut state = self.state.write().await;
                state.udp_index.insert(addr, client.session);
            }
            client.set_udp_addr(addr);
            client.set_udp_active(true);
            debug!(session = client.session, %addr, "udp path established");
            client.queue_udp(plain);
            return;
        }
        debug!(%addr, "datagram from unknown source, ignoring");
    }

    /// Reply to a bare server-query ping.
    async fn pong(&self, id: u64) -> PongPacket {
        let users = {
            let state = self.state.read().await;
            state.ready_clients().count() as u32
        };
        PongPacket {
            id,
            version: self.version.v1(),
            users,
            max_users: self.cfg_int("MaxUsers") as u32,
            bandwidth: self.cfg_int("MaxBandwidth") as u32,
        }
    }

    /// Removes temporary channels whose last occupant has left, announcing
    /// each removal exactly once. Runs on the tick after they empty.
    pub async fn reap_temporary_channels(&self) -> Vec<u32> {
        let mut state = self.state.write().await;
        let expired = state.channels.expired_temporary();
        let mut removed = Vec::new();
        for id in expired {
            if state.channels.remove(id).is_ok() {
                removed.push(id);
                let mut msg = msgs::ChannelRemove::new();
                msg.set_channel_id(id);
                state.broadcast(&msg.into());
            }
        }
        if !removed.is_empty() {
            state.clear_caches();
        }
        drop(state);
        for id in &removed {
            debug!(server = self.id, channel = id, "reaped temporary channel");
        }
        removed
    }

    /// One-second housekeeping: ping timeouts, temporary channel reaping
    /// and snapshot triggers.
    async fn tick_loop(server: Arc<Server>) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        loop {
            interval.tick().await;
            ticks += 1;

            // Ping timeouts.
            let timeout = server.cfg_int("TimeoutSeconds") as u64;
            let timed_out: Vec<Arc<Client>> = {
                let state = server.state.read().await;
                state
                    .clients
                    .values()
                    .filter(|c| c.bandwidth.lock().unwrap().idle_seconds() > timeout)
                    .cloned()
                    .collect()
            };
            for client in timed_out {
                info!(session = client.session, "ping timeout");
                client.disconnect(&server).await;
            }

            server.reap_temporary_channels().await;

            if ticks % FREEZE_INTERVAL_SECS == 0 {
                server.freeze_if_dirty().await;
            }
        }
    }
}

/// The process-wide set of virtual servers.
pub struct Registry {
    pub servers: Vec<Arc<Server>>,
}

impl Registry {
    /// Loads every server found under `data_dir/servers/`, creating the
    /// default server 1 if none exist.
    pub fn load(data_dir: &Path) -> anyhow::Result<Registry> {
        let mut ids = Vec::new();
        let servers_dir = data_dir.join("servers");
        if servers_dir.is_dir() {
            for entry in std::fs::read_dir(&servers_dir)? {
                let entry = entry?;
                if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    ids.push(id);
                }
            }
        }
        if ids.is_empty() {
            ids.push(1);
        }
        ids.sort_unstable();

        let mut servers = Vec::new();
        for id in ids {
            servers.push(Server::new(id, data_dir)?);
        }
        Ok(Registry { servers })
    }

    /// Default port of a virtual server: 64738 for server 1, counting up.
    pub fn port_for(id: u64) -> u16 {
        64738 + (id as u16) - 1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_ids_are_unique_while_live() {
        let mut pool = SessionPool::default();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(pool.allocate()), "duplicate session id");
        }
    }

    #[test]
    fn session_ids_are_monotonic_and_skip_zero() {
        let mut pool = SessionPool::default();
        let first = pool.allocate();
        let second = pool.allocate();
        assert_eq!(first, 1);
        assert!(second > first);

        // Forcing a rollover must neither hand out 0 nor a live id.
        pool.next = u32::MAX;
        let high = pool.allocate();
        assert_eq!(high, u32::MAX);
        let wrapped = pool.allocate();
        assert!(wrapped != 0);
        assert!(!([first, second, high].contains(&wrapped)));
    }

    #[test]
    fn released_ids_come_back_only_after_rollover() {
        let mut pool = SessionPool::default();
        let a = pool.allocate();
        pool.release(a);
        // Monotonic: the very next allocation is a fresh id.
        let b = pool.allocate();
        assert_ne!(a, b);

        pool.next = u32::MAX;
        pool.allocate();
        // After rollover the counter passes the released id again.
        let reused = pool.allocate();
        assert_eq!(reused, a);
    }

    #[tokio::test]
    async fn pong_reports_configured_limits() {
        let server = Server::new_for_test();
        let pong = server.pong(7).await;
        assert_eq!(pong.id, 7);
        assert_eq!(pong.users, 0);
        assert_eq!(pong.max_users, 1000);
        assert_eq!(pong.bandwidth, 72_000);
        assert_eq!(pong.version, ClientVersion::new(1, 5, 0).v1());
    }

    #[tokio::test]
    async fn temporary_channel_reaped_once_after_emptying() {
        let server = Server::new_for_test();
        let (witness, mut queues) = client::testutil::mock_client(1, &server, 0, "witness");
        let temp = {
            let mut state = server.state.write().await;
            state.clients.insert(1, witness.clone());
            state.channels.member_join(0, 1);
            let temp = state.channels.add(0, "temp", true).unwrap();
            state.channels.member_join(temp, 5);
            temp
        };

        // Occupied: nothing to reap.
        assert!(server.reap_temporary_channels().await.is_empty());

        {
            let mut state = server.state.write().await;
            state.channels.member_leave(temp, 5);
        }

        // The tick after it empties removes it; later ticks are no-ops.
        assert_eq!(server.reap_temporary_channels().await, vec![temp]);
        assert!(server.reap_temporary_channels().await.is_empty());

        let mut announcements = 0;
        while let Ok(packet) = queues.control_rx.try_recv() {
            if matches!(packet, ControlPacket::ChannelRemove(_)) {
                announcements += 1;
            }
        }
        assert_eq!(announcements, 1);
        assert!(server.state.read().await.channels.get(temp).is_none());
    }

    #[tokio::test]
    async fn codec_recompute_prefers_majority_and_opus_threshold() {
        let server = Server::new_for_test();
        let (a, _qa) = client::testutil::mock_client(1, &server, 0, "a");
        let (b, _qb) = client::testutil::mock_client(2, &server, 0, "b");
        {
            a.profile.lock().unwrap().celt_codecs = vec![CELT_ALPHA];
            let mut profile = b.profile.lock().unwrap();
            profile.celt_codecs = vec![CELT_ALPHA, CELT_BETA];
            profile.opus = false;
        }
        {
            let mut state = server.state.write().await;
            state.clients.insert(1, a.clone());
            state.clients.insert(2, b.clone());
        }
        server.update_codec_versions(None).await;
        let state = server.state.read().await;
        assert_eq!(state.codec.alpha, CELT_ALPHA);
        assert_eq!(state.codec.beta, CELT_BETA);
        // One of two clients lacks Opus; the default threshold needs 100%.
        assert!(!state.codec.opus);
    }
}
