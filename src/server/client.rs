//! Per-connection client state.
//!
//! Every connection runs three tasks: the reliable receive loop (which also
//! drives the pre-ready handshake state machine), a writer draining the
//! outbound queues, and the UDP queue consumer. All shared channel and user
//! state is mutated by the server's router task only; the client itself
//! keeps its own mutable state behind short-lived locks.

use bytes::Bytes;
use bytes::BytesMut;
use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;

use crate::control::ControlPacket;
use crate::crypt::CryptState;
use crate::msgs;
use crate::server::acl::AclSubject;
use crate::server::bandwidth::BandwidthRecorder;
use crate::server::broadcast::VoiceBroadcast;
use crate::server::ratelimit::RateLimit;
use crate::server::target::VoiceTarget;
use crate::server::Message;
use crate::server::Server;
use crate::voice;
use crate::voice::UdpPacket;

/// Depth of the per-client queue of decrypted datagrams.
const UDP_QUEUE_DEPTH: usize = 64;
/// Depth of the per-client queue of tunneled voice frames. Voice never
/// waits for a slow receiver; overflow drops the frame for that receiver.
const TUNNEL_QUEUE_DEPTH: usize = 32;

/// Connection lifecycle. Everything before `Ready` is the handshake;
/// `Disconnected` is absorbing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Connected = 0,
    ServerSentVersion = 1,
    ClientSentVersion = 2,
    Authenticated = 3,
    Ready = 4,
    Disconnected = 5,
}

impl ClientState {
    fn from_u8(value: u8) -> ClientState {
        match value {
            0 => ClientState::Connected,
            1 => ClientState::ServerSentVersion,
            2 => ClientState::ClientSentVersion,
            3 => ClientState::Authenticated,
            4 => ClientState::Ready,
            _ => ClientState::Disconnected,
        }
    }
}

/// A protocol version, held in the full 64-bit form
/// (`major << 48 | minor << 32 | patch << 16`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClientVersion(pub u64);

impl ClientVersion {
    pub fn new(major: u16, minor: u16, patch: u16) -> Self {
        ClientVersion(
            (u64::from(major) << 48) | (u64::from(minor) << 32) | (u64::from(patch) << 16),
        )
    }

    /// From the legacy packed form (`major << 16 | minor << 8 | patch`).
    pub fn from_v1(v1: u32) -> Self {
        Self::new((v1 >> 16) as u16, ((v1 >> 8) & 0xff) as u16, (v1 & 0xff) as u16)
    }

    pub fn major(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub fn minor(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn patch(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The legacy packed form; components are clamped to their old widths.
    pub fn v1(self) -> u32 {
        (u32::from(self.major()) << 16)
            | (u32::from(self.minor().min(0xff)) << 8)
            | u32::from(self.patch().min(0xff))
    }

    pub fn v2(self) -> u64 {
        self.0
    }

    /// Whether the peer understands the length-delimited datagram framing.
    pub fn supports_protobuf(self) -> bool {
        self >= ClientVersion::new(1, 5, 0)
    }
}

/// Mutable per-client details, written by the router.
#[derive(Clone, Debug, Default)]
pub struct Profile {
    pub username: String,
    pub user_id: Option<u32>,
    pub cert_hash: String,
    pub cert_verified: bool,
    pub tokens: Vec<String>,
    pub version: ClientVersion,
    pub client_release: String,
    pub os_name: String,
    pub os_version: String,
    pub crypto_modes: Vec<String>,
    pub celt_codecs: Vec<i32>,
    pub opus: bool,
    pub channel: u32,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub priority_speaker: bool,
    pub recording: bool,
    pub plugin_context: Vec<u8>,
    pub plugin_identity: String,
    pub comment_blob: Option<String>,
    pub texture_blob: Option<String>,
}

/// Ping statistics as reported by the client: round-trip figures plus the
/// crypt counters of the client's receive direction.
#[derive(Clone, Copy, Debug, Default)]
pub struct PingStats {
    pub udp_packets: u32,
    pub tcp_packets: u32,
    pub udp_ping_avg: f32,
    pub udp_ping_var: f32,
    pub tcp_ping_avg: f32,
    pub tcp_ping_var: f32,
    pub remote_good: u32,
    pub remote_late: u32,
    pub remote_lost: u32,
    pub remote_resync: u32,
}

/// Receiver ends of a client's queues, consumed by its tasks.
pub struct ClientQueues {
    pub control_rx: mpsc::UnboundedReceiver<ControlPacket>,
    pub tunnel_rx: mpsc::Receiver<ControlPacket>,
    pub udprecv_rx: mpsc::Receiver<BytesMut>,
}

/// A live connection.
pub struct Client {
    pub session: u32,
    server: Weak<Server>,
    remote: SocketAddr,
    pub connected_at: Instant,

    state: AtomicU8,
    disconnected: AtomicBool,
    kicked: AtomicBool,
    udp: AtomicBool,
    udp_addr: Mutex<Option<SocketAddr>>,

    pub crypt: Mutex<CryptState>,
    pub bandwidth: Mutex<BandwidthRecorder>,
    pub global_limit: Mutex<RateLimit>,
    pub plugin_limit: Mutex<RateLimit>,
    pub targets: Mutex<Vec<(u8, VoiceTarget)>>,
    pub profile: Mutex<Profile>,
    pub ping_stats: Mutex<PingStats>,

    control_tx: mpsc::UnboundedSender<ControlPacket>,
    tunnel_tx: mpsc::Sender<ControlPacket>,
    udprecv_tx: Mutex<Option<mpsc::Sender<BytesMut>>>,
    ready_tx: Mutex<Option<oneshot::Sender<bool>>>,
    shutdown: watch::Sender<bool>,

    /// Unix seconds of the last crypt resync request sent to this client.
    last_resync: Mutex<i64>,
    /// Voice frames dropped because this client's send path was saturated.
    udp_drops: AtomicU32,
}

impl Client {
    /// Creates the client and the receiving halves of its queues.
    pub fn new(
        session: u32,
        server: &Arc<Server>,
        remote: SocketAddr,
        crypt: CryptState,
    ) -> (Arc<Client>, ClientQueues) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (tunnel_tx, tunnel_rx) = mpsc::channel(TUNNEL_QUEUE_DEPTH);
        let (udprecv_tx, udprecv_rx) = mpsc::channel(UDP_QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);
        let (message_rate, message_burst, plugin_rate, plugin_burst) = {
            (
                server.cfg_int("RateLimitMessages") as f64,
                server.cfg_int("RateLimitBurst") as f64,
                server.cfg_int("PluginMessagesPerSecond") as f64,
                server.cfg_int("PluginMessageBurst") as f64,
            )
        };
        let client = Arc::new(Client {
            session,
            server: Arc::downgrade(server),
            remote,
            connected_at: Instant::now(),
            state: AtomicU8::new(ClientState::Connected as u8),
            disconnected: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
            udp: AtomicBool::new(false),
            udp_addr: Mutex::new(None),
            crypt: Mutex::new(crypt),
            bandwidth: Mutex::new(BandwidthRecorder::new()),
            global_limit: Mutex::new(RateLimit::new(message_rate, message_burst)),
            plugin_limit: Mutex::new(RateLimit::new(plugin_rate, plugin_burst)),
            targets: Mutex::new(Vec::new()),
            profile: Mutex::new(Profile::default()),
            ping_stats: Mutex::new(PingStats::default()),
            control_tx,
            tunnel_tx,
            udprecv_tx: Mutex::new(Some(udprecv_tx)),
            ready_tx: Mutex::new(None),
            shutdown,
            last_resync: Mutex::new(0),
            udp_drops: AtomicU32::new(0),
        });
        (
            client,
            ClientQueues {
                control_rx,
                tunnel_rx,
                udprecv_rx,
            },
        )
    }

    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Whether datagrams currently flow directly rather than tunneled.
    pub fn udp_active(&self) -> bool {
        self.udp.load(Ordering::Acquire)
    }

    pub fn set_udp_active(&self, active: bool) {
        self.udp.store(active, Ordering::Release);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        *self.udp_addr.lock().unwrap()
    }

    pub fn set_udp_addr(&self, addr: SocketAddr) {
        *self.udp_addr.lock().unwrap() = Some(addr);
    }

    pub fn udp_drops(&self) -> u32 {
        self.udp_drops.load(Ordering::Relaxed)
    }

    pub fn is_registered(&self) -> bool {
        self.profile.lock().unwrap().user_id.is_some()
    }

    pub fn is_superuser(&self) -> bool {
        self.profile.lock().unwrap().user_id == Some(crate::server::user::SUPERUSER_ID)
    }

    pub fn user_id(&self) -> Option<u32> {
        self.profile.lock().unwrap().user_id
    }

    pub fn channel_id(&self) -> u32 {
        self.profile.lock().unwrap().channel
    }

    pub fn shown_name(&self) -> String {
        self.profile.lock().unwrap().username.clone()
    }

    /// Whether the datagram plane runs the legacy framing for this client.
    pub fn legacy_udp(&self) -> bool {
        !self.profile.lock().unwrap().version.supports_protobuf()
    }

    /// Snapshot of the details the ACL evaluator needs.
    pub fn acl_subject(&self) -> AclSubject {
        let profile = self.profile.lock().unwrap();
        AclSubject {
            session: self.session,
            user_id: profile.user_id,
            tokens: profile.tokens.clone(),
            channel: profile.channel,
        }
    }

    /// Queues a reliable message for this client.
    pub fn send_message(&self, packet: impl Into<ControlPacket>) {
        // A failed send means the writer is gone; teardown is in progress.
        let _ = self.control_tx.send(packet.into());
    }

    /// Sends an (unencrypted) datagram payload: encrypted over the UDP
    /// socket when it is up, tunneled through the control channel
    /// otherwise. Never blocks; a saturated path drops the frame.
    pub fn send_udp(&self, server: &Server, payload: &[u8]) {
        if self.udp_active() {
            if let (Some(addr), Some(socket)) = (self.udp_addr(), server.udp_socket()) {
                let mut wire = BytesMut::with_capacity(payload.len() + crate::crypt::OVERHEAD);
                self.crypt.lock().unwrap().encrypt(payload, &mut wire);
                if socket.try_send_to(&wire, addr).is_err() {
                    self.udp_drops.fetch_add(1, Ordering::Relaxed);
                }
                return;
            }
        }
        let tunneled = ControlPacket::UDPTunnel(Bytes::copy_from_slice(payload));
        if self.tunnel_tx.try_send(tunneled).is_err() {
            self.udp_drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Hands a raw (already decrypted) datagram to the client's UDP queue.
    pub fn queue_udp(&self, buf: BytesMut) {
        let tx = self.udprecv_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            if tx.try_send(buf).is_err() {
                trace!(session = self.session, "udp receive queue full, dropping");
            }
        }
    }

    /// Arms the single-shot readiness signal and returns the waiting end.
    pub fn arm_ready_signal(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *self.ready_tx.lock().unwrap() = Some(tx);
        rx
    }

    /// Fires the readiness signal; the router calls this exactly once per
    /// authentication attempt.
    pub fn signal_ready(&self, ok: bool) {
        if let Some(tx) = self.ready_tx.lock().unwrap().take() {
            let _ = tx.send(ok);
        }
    }

    /// Requests a crypt resync from the client if the datagram channel has
    /// been failing for a while. Rate limited to one request per 5 seconds.
    pub fn maybe_request_crypt_resync(&self) {
        let good_elapsed = self
            .crypt
            .lock()
            .unwrap()
            .last_good_elapsed()
            .map(|d| d.as_secs())
            .unwrap_or(u64::MAX);
        if good_elapsed <= 5 {
            return;
        }
        let now = crate::server::ban::unix_now();
        let mut last = self.last_resync.lock().unwrap();
        if now - *last > 5 {
            *last = now;
            debug!(session = self.session, "requesting crypt resync");
            self.send_message(msgs::CryptSetup::new());
        }
    }

    /// Idempotent teardown: removes the client from the server, closes its
    /// queues, releases a pending readiness signal and wakes its tasks.
    pub async fn disconnect(self: &Arc<Self>, server: &Arc<Server>) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_ready = self.state() == ClientState::Ready;
        self.set_state(ClientState::Disconnected);

        server.remove_client(self, was_ready).await;

        // Close the UDP queue; its consumer exits on the closed channel.
        self.udprecv_tx.lock().unwrap().take();

        // If the client dropped out mid-authentication the receive loop may
        // be blocked on the readiness signal.
        self.signal_ready(false);

        let _ = self.shutdown.send(true);

        info!(session = self.session, name = %self.shown_name(), "disconnected");

        server.update_codec_versions(None).await;
    }

    /// Logs a client-fatal protocol error and tears the connection down.
    pub async fn fatal(self: &Arc<Self>, server: &Arc<Server>, why: &str) {
        error!(session = self.session, "{}", why);
        self.disconnect(server).await;
    }

    /// Whether the disconnect was a kick or ban; kicks are announced with
    /// a reasoned UserRemove by the handler, so teardown stays quiet.
    pub fn was_kicked(&self) -> bool {
        self.kicked.load(Ordering::Acquire)
    }

    /// Disconnect initiated by the server (kick, ban or rejected login).
    pub async fn force_disconnect(self: &Arc<Self>, server: &Arc<Server>) {
        self.kicked.store(true, Ordering::Release);
        self.disconnect(server).await;
    }
}

/// Drives the reliable receive loop, including the pre-ready handshake.
pub async fn recv_loop<S>(server: Arc<Server>, client: Arc<Client>, mut stream: S)
where
    S: Stream<Item = io::Result<ControlPacket>> + Unpin,
{
    let mut shutdown = client.shutdown.subscribe();
    loop {
        match client.state() {
            ClientState::Disconnected => return,
            ClientState::Connected => {
                // Before the client authenticates it must learn which
                // protocol version we speak.
                let mut version = msgs::Version::new();
                version.set_version_v1(server.version().v1());
                version.set_version_v2(server.version().v2());
                version.set_release("Grumble".to_owned());
                if server.cfg_bool("SendOSInfo") {
                    version.set_os(std::env::consts::OS.to_owned());
                    version.set_os_version("(Unknown version)".to_owned());
                }
                client.send_message(version);
                client.set_state(ClientState::ServerSentVersion);
                continue;
            }
            _ => {}
        }

        let packet = tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            item = stream.next() => match item {
                Some(Ok(packet)) => packet,
                Some(Err(err)) => {
                    client.fatal(&server, &format!("control channel error: {}", err)).await;
                    return;
                }
                None => {
                    client.disconnect(&server).await;
                    return;
                }
            },
        };

        match client.state() {
            ClientState::ServerSentVersion => match packet {
                ControlPacket::Version(msg) => {
                    handle_version(&client, *msg);
                    client.set_state(ClientState::ClientSentVersion);
                }
                other => {
                    client
                        .fatal(
                            &server,
                            &format!("expected Version during handshake, got {}", other.name()),
                        )
                        .await;
                    return;
                }
            },
            ClientState::ClientSentVersion => {
                match packet {
                    ControlPacket::Authenticate(_) => {}
                    other => {
                        client
                            .fatal(
                                &server,
                                &format!("expected Authenticate, got {}", other.name()),
                            )
                            .await;
                        return;
                    }
                }
                let ready = client.arm_ready_signal();
                client.set_state(ClientState::Authenticated);
                server.enqueue(Message::new(client.clone(), packet)).await;

                // Block until the router has either made us a participant
                // or rejected the attempt.
                let _ = ready.await;
                if client.is_disconnected() {
                    return;
                }
            }
            ClientState::Ready => {
                match packet {
                    // UDPTunnel is the voice path for clients without a
                    // working UDP connection: high priority, bypasses the
                    // router.
                    ControlPacket::UDPTunnel(datagram) => {
                        client.set_udp_active(false);
                        client.queue_udp(BytesMut::from(&datagram[..]));
                    }
                    other => {
                        client.bandwidth.lock().unwrap().reset_idle_seconds();
                        server.enqueue(Message::new(client.clone(), other)).await;
                    }
                }
            }
            ClientState::Connected | ClientState::Authenticated => {
                // Messages must not arrive while the router holds the
                // connection; the codec only yields them on traffic, so
                // this is a misbehaving client.
                client
                    .fatal(&server, &format!("unexpected {} before sync", packet.name()))
                    .await;
                return;
            }
            ClientState::Disconnected => return,
        }
    }
}

fn handle_version(client: &Arc<Client>, msg: msgs::Version) {
    let mut profile = client.profile.lock().unwrap();
    profile.version = if msg.has_version_v2() {
        ClientVersion(msg.get_version_v2())
    } else {
        ClientVersion::from_v1(msg.get_version_v1())
    };
    profile.client_release = msg.get_release().to_owned();
    profile.os_name = msg.get_os().to_owned();
    profile.os_version = msg.get_os_version().to_owned();
    profile.crypto_modes = msg.get_crypto_modes().to_vec();
}

/// Serializes all writes to the control channel.
pub async fn writer_loop<K>(
    client: Arc<Client>,
    mut sink: K,
    mut control_rx: mpsc::UnboundedReceiver<ControlPacket>,
    mut tunnel_rx: mpsc::Receiver<ControlPacket>,
) where
    K: Sink<ControlPacket, Error = io::Error> + Unpin,
{
    let mut shutdown = client.shutdown.subscribe();
    loop {
        if client.is_disconnected() {
            break;
        }
        let packet = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            packet = control_rx.recv() => packet,
            packet = tunnel_rx.recv() => packet,
        };
        let packet = match packet {
            Some(packet) => packet,
            None => break,
        };
        if let Err(err) = sink.send(packet).await {
            if let Some(server) = client.server() {
                client
                    .fatal(&server, &format!("write error: {}", err))
                    .await;
            }
            break;
        }
    }
    // Flush anything still queued (a Reject or PermissionDenied explaining
    // the teardown, typically) before closing the stream.
    while let Ok(packet) = control_rx.try_recv() {
        if sink.send(packet).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Consumes the client's queue of decrypted datagrams: rate limits, parses
/// and either echoes (pings, loopback) or forwards to the voice dispatcher.
pub async fn udp_loop(
    server: Arc<Server>,
    client: Arc<Client>,
    mut rx: mpsc::Receiver<BytesMut>,
) {
    while let Some(buf) = rx.recv().await {
        if buf.is_empty() {
            // Zero-length sentinel, the queue is being closed.
            return;
        }

        let max_bytes = server.max_bandwidth_bytes();
        if !client.bandwidth.lock().unwrap().add_frame(buf.len(), max_bytes) {
            debug!(
                session = client.session,
                bytes = buf.len(),
                "bandwidth limit reached, dropping voice frame"
            );
            continue;
        }

        let assume_legacy = client.legacy_udp() || !server.version().supports_protobuf();
        let (packet, legacy) = match voice::parse_udp_packet(
            &buf,
            assume_legacy,
            voice::Direction::Serverbound,
        ) {
            Some(parsed) => parsed,
            None => {
                debug!(session = client.session, "unparseable datagram, ignoring");
                continue;
            }
        };

        match packet {
            UdpPacket::Ping(ping) => {
                let echo = UdpPacket::Ping(ping);
                match echo.data(legacy) {
                    Ok(data) => client.send_udp(&server, &data),
                    Err(err) => {
                        error!(session = client.session, "cannot encode ping echo: {}", err)
                    }
                }
            }
            UdpPacket::Audio(mut audio) => {
                audio.sender_session = Some(client.session);
                if audio.target == voice::TARGET_SERVER_LOOPBACK {
                    match UdpPacket::Audio(audio).data(legacy) {
                        Ok(data) => client.send_udp(&server, &data),
                        Err(err) => {
                            error!(session = client.session, "cannot encode loopback: {}", err)
                        }
                    }
                } else {
                    server
                        .enqueue_voice(VoiceBroadcast::new(client.clone(), audio))
                        .await;
                }
            }
        }
    }
}
