//! Voice channel packets and the dual-framing UDP codec.
//!
//! Two wire shapes coexist. The legacy framing packs the message kind into
//! the top three bits of the first byte and the target into the low five;
//! the length-delimited framing uses a full type byte (0 = ping, 1 = audio)
//! followed by a serialized [msgs::PingUDP] / [msgs::AudioUDP]. Which shape
//! a client speaks is decided per connection: the length-delimited form is
//! used only when both peers advertise support for it.
//!
//! Parsing returns the packet plus the shape it was detected in; emission
//! picks the shape per recipient, never per sender.

use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use protobuf::Message;
use std::io;

use crate::msgs;
use crate::packetbuf::PacketBuf;
use crate::varint::BufMutExt;

/// Maximum size of an (unencrypted) voice datagram.
pub const MAX_PACKET_SIZE: usize = 1024;

/// Target value for regular speech into the current channel.
pub const TARGET_REGULAR_SPEECH: u8 = 0;
/// Target value for server-side loopback.
pub const TARGET_SERVER_LOOPBACK: u8 = 31;

// Legacy message kinds, top three bits of the first byte.
const LEGACY_KIND_CELT_ALPHA: u8 = 0;
const LEGACY_KIND_PING: u8 = 1;
const LEGACY_KIND_SPEEX: u8 = 2;
const LEGACY_KIND_CELT_BETA: u8 = 3;
const LEGACY_KIND_OPUS: u8 = 4;

// Length-delimited type bytes.
const FRAMED_TYPE_PING: u8 = 0;
const FRAMED_TYPE_AUDIO: u8 = 1;

/// Audio data payload of [AudioPacket]s.
#[derive(Clone, Debug, PartialEq)]
pub enum VoicePayload {
    /// CELT Alpha (0.7.0) encoded audio frames.
    CeltAlpha(Vec<Bytes>),
    /// CELT Beta (0.11.0) encoded audio frames.
    CeltBeta(Vec<Bytes>),
    /// Speex encoded audio frames.
    Speex(Vec<Bytes>),
    /// Opus encoded audio frame with end-of-transmission bit.
    Opus(Bytes, bool),
}

impl VoicePayload {
    fn legacy_kind(&self) -> u8 {
        match self {
            VoicePayload::CeltAlpha(_) => LEGACY_KIND_CELT_ALPHA,
            VoicePayload::Speex(_) => LEGACY_KIND_SPEEX,
            VoicePayload::CeltBeta(_) => LEGACY_KIND_CELT_BETA,
            VoicePayload::Opus(_, _) => LEGACY_KIND_OPUS,
        }
    }

    /// True for the last packet of a transmission.
    pub fn is_terminator(&self) -> bool {
        match self {
            VoicePayload::Opus(_, term) => *term,
            VoicePayload::CeltAlpha(frames)
            | VoicePayload::CeltBeta(frames)
            | VoicePayload::Speex(frames) => frames.last().map(|f| f.is_empty()).unwrap_or(false),
        }
    }
}

/// Packet containing audio data.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioPacket {
    /// Voice target (serverbound) or context (clientbound).
    ///
    /// Only values 0-31 are valid: 0 is regular speech, 1..=30 are whisper
    /// slots, 31 is server loopback.
    pub target: u8,
    /// Session of the speaker. Absent on serverbound packets; the server
    /// fills it in before fan-out.
    pub sender_session: Option<u32>,
    /// Sequence number of the first audio frame in this packet.
    ///
    /// Packets may contain multiple frames, so this may increase by more
    /// than one per packet.
    pub frame_number: u64,
    /// The actual audio data.
    pub payload: VoicePayload,
    /// Positional audio information.
    pub positional: Option<[f32; 3]>,
    /// Per-listener volume adjustment. Only representable in the
    /// length-delimited framing.
    pub volume_adjustment: Option<f32>,
}

/// Ping packets carry opaque timestamp-like values which are echoed back.
#[derive(Clone, Debug, PartialEq)]
pub struct VoicePing {
    /// Opaque timestamp-like value. Unless this is the echo, no assumptions
    /// about it should be made.
    pub timestamp: u64,
    /// Set on the bare 12-byte legacy form; the reply must carry server
    /// details (see [crate::ping]).
    pub extended: bool,
}

/// A packet transmitted via the voice channel, in either framing.
#[derive(Clone, Debug, PartialEq)]
pub enum UdpPacket {
    /// Connection ping, echoed back by the receiving side.
    Ping(VoicePing),
    /// Audio data for fan-out.
    Audio(AudioPacket),
}

impl UdpPacket {
    /// Sets the speaker session on audio packets; pings are unaffected.
    pub fn set_sender_session(&mut self, session: u32) {
        if let UdpPacket::Audio(audio) = self {
            audio.sender_session = Some(session);
        }
    }

    /// Voice target of audio packets; pings report regular speech.
    pub fn target(&self) -> u8 {
        match self {
            UdpPacket::Ping(_) => TARGET_REGULAR_SPEECH,
            UdpPacket::Audio(audio) => audio.target,
        }
    }

    /// Serializes the packet in the requested framing.
    pub fn data(&self, legacy: bool) -> io::Result<Bytes> {
        match self {
            UdpPacket::Ping(ping) => ping.data(legacy),
            UdpPacket::Audio(audio) => audio.data(legacy),
        }
    }
}

impl VoicePing {
    fn data(&self, legacy: bool) -> io::Result<Bytes> {
        if legacy {
            let mut dst = BytesMut::with_capacity(13);
            if self.extended {
                // Bare form: four zero bytes, then the opaque timestamp.
                let mut buf = [0u8; 12];
                let mut pd = PacketBuf::new(&mut buf);
                pd.put_u32(0);
                pd.put_u64(self.timestamp);
                dst.extend_from_slice(&buf);
            } else {
                dst.put_u8(LEGACY_KIND_PING << 5);
                dst.put_varint(self.timestamp);
            }
            Ok(dst.freeze())
        } else {
            let mut msg = msgs::PingUDP::new();
            msg.set_timestamp(self.timestamp);
            msg.set_request_extended_information(self.extended);
            framed(FRAMED_TYPE_PING, &msg)
        }
    }
}

impl AudioPacket {
    fn data(&self, legacy: bool) -> io::Result<Bytes> {
        if legacy {
            self.legacy_data()
        } else {
            self.framed_data()
        }
    }

    fn legacy_data(&self) -> io::Result<Bytes> {
        let mut dst = BytesMut::with_capacity(MAX_PACKET_SIZE);
        dst.put_u8(self.payload.legacy_kind() << 5 | self.target & 0x1f);
        if let Some(session) = self.sender_session {
            dst.put_varint(u64::from(session));
        }
        dst.put_varint(self.frame_number);
        match &self.payload {
            VoicePayload::CeltAlpha(frames)
            | VoicePayload::Speex(frames)
            | VoicePayload::CeltBeta(frames) => {
                let mut iter = frames.iter().peekable();
                while let Some(frame) = iter.next() {
                    if frame.len() > 0x7f {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "frame too long for legacy framing",
                        ));
                    }
                    let continuation = if iter.peek().is_some() { 0x80 } else { 0 };
                    dst.put_u8(continuation | frame.len() as u8);
                    dst.put(frame.as_ref());
                }
            }
            VoicePayload::Opus(frame, terminator) => {
                if frame.len() > 0x1fff {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "frame too long for legacy framing",
                    ));
                }
                let term_bit = if *terminator { 0x2000 } else { 0 };
                dst.put_varint(term_bit | frame.len() as u64);
                dst.put(frame.as_ref());
            }
        }
        if let Some(pos) = &self.positional {
            let mut buf = [0u8; 12];
            let mut pd = PacketBuf::new(&mut buf);
            for f in pos {
                pd.put_f32(*f);
            }
            dst.extend_from_slice(&buf);
        }
        Ok(dst.freeze())
    }

    fn framed_data(&self) -> io::Result<Bytes> {
        let (frame, terminator) = match &self.payload {
            VoicePayload::Opus(frame, terminator) => (frame, *terminator),
            _ => {
                // The length-delimited framing carries Opus only.
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "codec not representable in length-delimited framing",
                ));
            }
        };
        let mut msg = msgs::AudioUDP::new();
        match self.sender_session {
            Some(session) => {
                // Clientbound: the low five bits become the context.
                msg.set_context(u32::from(self.target));
                msg.set_sender_session(session);
            }
            None => msg.set_target(u32::from(self.target)),
        }
        msg.set_frame_number(self.frame_number);
        msg.set_opus_data(frame.to_vec());
        msg.set_is_terminator(terminator);
        if let Some(pos) = &self.positional {
            msg.set_positional_data(pos.to_vec());
        }
        if let Some(vol) = self.volume_adjustment {
            msg.set_volume_adjustment(vol);
        }
        framed(FRAMED_TYPE_AUDIO, &msg)
    }
}

fn framed<M: Message>(kind: u8, msg: &M) -> io::Result<Bytes> {
    let mut dst = BytesMut::with_capacity(1 + msg.compute_size() as usize);
    dst.put_u8(kind);
    let body = msg
        .write_to_bytes()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    dst.extend_from_slice(&body);
    Ok(dst.freeze())
}

/// Which way a datagram travels. Legacy audio traveling towards clients
/// carries a varint speaker session that serverbound audio lacks, so the
/// parser has to know the direction up front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Serverbound,
    Clientbound,
}

/// Parses a datagram in whichever framing it turns out to be in, returning
/// the packet and whether the legacy framing was detected.
///
/// `assume_legacy` should be true unless both peers advertise support for
/// the length-delimited framing. A length-delimited ping is accepted even
/// from legacy peers (clients probe with it before the negotiation settles),
/// and a 12- or 24-byte datagram with a zeroed prefix is always the bare
/// legacy ping.
pub fn parse_udp_packet(
    data: &[u8],
    assume_legacy: bool,
    dir: Direction,
) -> Option<(UdpPacket, bool)> {
    if data.is_empty() {
        return None;
    }
    let header = data[0];

    if (data.len() == 12 || data.len() == 24) && data[..4] == [0, 0, 0, 0] {
        return parse_extended_ping(data).map(|pkt| (pkt, true));
    }

    if assume_legacy {
        if header == FRAMED_TYPE_PING {
            if let Some(pkt) = parse_framed_ping(&data[1..]) {
                return Some((pkt, false));
            }
        }
        let kind = header >> 5;
        let target = header & 0x1f;
        let pkt = match kind {
            LEGACY_KIND_PING => parse_legacy_ping(&data[1..]),
            LEGACY_KIND_CELT_ALPHA => {
                parse_legacy_audio(&data[1..], target, dir, VoicePayload::CeltAlpha)
            }
            LEGACY_KIND_SPEEX => parse_legacy_audio(&data[1..], target, dir, VoicePayload::Speex),
            LEGACY_KIND_CELT_BETA => {
                parse_legacy_audio(&data[1..], target, dir, VoicePayload::CeltBeta)
            }
            LEGACY_KIND_OPUS => parse_legacy_opus(&data[1..], target, dir),
            _ => None,
        };
        pkt.map(|pkt| (pkt, true))
    } else {
        let pkt = match header {
            FRAMED_TYPE_PING => parse_framed_ping(&data[1..]),
            FRAMED_TYPE_AUDIO => parse_framed_audio(&data[1..]),
            _ => None,
        };
        pkt.map(|pkt| (pkt, false))
    }
}

fn parse_extended_ping(data: &[u8]) -> Option<UdpPacket> {
    let mut scratch = data.to_vec();
    let mut pd = PacketBuf::new(&mut scratch);
    if pd.get_u32() != 0 {
        return None;
    }
    let timestamp = pd.get_u64();
    if !pd.is_valid() {
        return None;
    }
    Some(UdpPacket::Ping(VoicePing {
        timestamp,
        extended: true,
    }))
}

fn parse_legacy_ping(data: &[u8]) -> Option<UdpPacket> {
    let mut scratch = data.to_vec();
    let mut pd = PacketBuf::new(&mut scratch);
    let timestamp = pd.get_varint();
    if !pd.is_valid() {
        return None;
    }
    Some(UdpPacket::Ping(VoicePing {
        timestamp,
        extended: false,
    }))
}

fn parse_framed_ping(data: &[u8]) -> Option<UdpPacket> {
    let msg = msgs::PingUDP::parse_from_bytes(data).ok()?;
    Some(UdpPacket::Ping(VoicePing {
        timestamp: msg.get_timestamp(),
        extended: msg.get_request_extended_information(),
    }))
}

fn parse_framed_audio(data: &[u8]) -> Option<UdpPacket> {
    let msg = msgs::AudioUDP::parse_from_bytes(data).ok()?;
    if msg.get_opus_data().is_empty() {
        // Audio packets without audio data are invalid.
        return None;
    }
    let target = if msg.has_context() {
        msg.get_context()
    } else {
        msg.get_target()
    };
    if target > u32::from(TARGET_SERVER_LOOPBACK) {
        return None;
    }
    let positional = match *msg.get_positional_data() {
        [x, y, z] => Some([x, y, z]),
        [] => None,
        _ => return None,
    };
    Some(UdpPacket::Audio(AudioPacket {
        target: target as u8,
        sender_session: if msg.get_sender_session() != 0 {
            Some(msg.get_sender_session())
        } else {
            None
        },
        frame_number: msg.get_frame_number(),
        payload: VoicePayload::Opus(
            Bytes::copy_from_slice(msg.get_opus_data()),
            msg.get_is_terminator(),
        ),
        positional,
        volume_adjustment: if msg.get_volume_adjustment() != 0.0 {
            Some(msg.get_volume_adjustment())
        } else {
            None
        },
    }))
}

fn read_session(pd: &mut PacketBuf, dir: Direction) -> Option<u32> {
    match dir {
        Direction::Serverbound => None,
        Direction::Clientbound => Some(pd.get_varint() as u32),
    }
}

fn parse_legacy_audio(
    data: &[u8],
    target: u8,
    dir: Direction,
    payload: impl FnOnce(Vec<Bytes>) -> VoicePayload,
) -> Option<UdpPacket> {
    let mut scratch = data.to_vec();
    let mut pd = PacketBuf::new(&mut scratch);
    let sender_session = read_session(&mut pd, dir);
    let frame_number = pd.get_varint();

    // A chain of TOC bytes: bit 7 flags a following frame, bits 0..=6 are
    // the frame length. A zero-length frame terminates the transmission.
    let mut frames = Vec::new();
    loop {
        let toc = pd.get_u8();
        let len = usize::from(toc & 0x7f);
        let start = pd.size();
        pd.skip(len);
        if !pd.is_valid() {
            return None;
        }
        frames.push(Bytes::copy_from_slice(&data[start..start + len]));
        if toc & 0x80 == 0 {
            break;
        }
    }

    let positional = parse_positional(&mut pd)?;
    Some(UdpPacket::Audio(AudioPacket {
        target,
        sender_session,
        frame_number,
        payload: payload(frames),
        positional,
        volume_adjustment: None,
    }))
}

fn parse_legacy_opus(data: &[u8], target: u8, dir: Direction) -> Option<UdpPacket> {
    let mut scratch = data.to_vec();
    let mut pd = PacketBuf::new(&mut scratch);
    let sender_session = read_session(&mut pd, dir);
    let frame_number = pd.get_varint();
    let header = pd.get_varint();
    let terminator = header & 0x2000 == 0x2000;
    let len = (header & 0x1fff) as usize;
    let start = pd.size();
    pd.skip(len);
    if !pd.is_valid() {
        return None;
    }
    let frame = Bytes::copy_from_slice(&data[start..start + len]);

    let positional = parse_positional(&mut pd)?;
    Some(UdpPacket::Audio(AudioPacket {
        target,
        sender_session,
        frame_number,
        payload: VoicePayload::Opus(frame, terminator),
        positional,
        volume_adjustment: None,
    }))
}

/// Trailing bytes after the audio payload are either absent or exactly
/// three floats of positional data; anything else invalidates the packet.
fn parse_positional(pd: &mut PacketBuf) -> Option<Option<[f32; 3]>> {
    match pd.left() {
        0 => Some(None),
        12 => {
            let pos = [pd.get_f32(), pd.get_f32(), pd.get_f32()];
            if pd.is_valid() {
                Some(Some(pos))
            } else {
                None
            }
        }
        _ => None,
    }
}
