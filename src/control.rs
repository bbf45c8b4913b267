//! Control channel packets and codec.
//!
//! The reliable channel carries big-endian `u16 kind || u32 length` framed
//! protobuf messages. Message type 1 (`UDPTunnel`) is the exception: its
//! payload is a verbatim voice datagram, carried for clients whose UDP path
//! is unavailable, and is therefore surfaced as raw bytes rather than a
//! parsed message.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use protobuf::Message;
use std::io;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::msgs;

/// Maximum payload size of a control frame (8 MiB - 1).
pub const MAX_PAYLOAD_SIZE: usize = 0x7f_ffff;

const HEADER_SIZE: usize = 6;

fn invalid_data(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

macro_rules! packets {
    ($($kind:expr => $name:ident),* $(,)?) => {
        /// A packet on the reliable control channel.
        #[derive(Clone, Debug, PartialEq)]
        pub enum ControlPacket {
            /// Tunneled voice datagram, passed through verbatim.
            UDPTunnel(Bytes),
            $(
                #[allow(missing_docs)]
                $name(Box<msgs::$name>),
            )*
        }

        impl ControlPacket {
            /// Numeric message type on the wire.
            pub fn kind(&self) -> u16 {
                match self {
                    ControlPacket::UDPTunnel(_) => 1,
                    $(ControlPacket::$name(_) => $kind,)*
                }
            }

            /// Message name, for log lines.
            pub fn name(&self) -> &'static str {
                match self {
                    ControlPacket::UDPTunnel(_) => "UDPTunnel",
                    $(ControlPacket::$name(_) => stringify!($name),)*
                }
            }

            fn parse(kind: u16, payload: Bytes) -> io::Result<ControlPacket> {
                match kind {
                    1 => Ok(ControlPacket::UDPTunnel(payload)),
                    $($kind => Ok(ControlPacket::$name(Box::new(
                        msgs::$name::parse_from_bytes(&payload).map_err(invalid_data)?,
                    ))),)*
                    _ => Err(invalid_data(format!("unknown message type {}", kind))),
                }
            }

            fn payload(&self) -> io::Result<Vec<u8>> {
                match self {
                    ControlPacket::UDPTunnel(bytes) => Ok(bytes.to_vec()),
                    $(ControlPacket::$name(msg) => {
                        msg.write_to_bytes().map_err(invalid_data)
                    })*
                }
            }
        }

        $(
            impl From<msgs::$name> for ControlPacket {
                fn from(msg: msgs::$name) -> Self {
                    ControlPacket::$name(Box::new(msg))
                }
            }
        )*
    };
}

packets! {
    0 => Version,
    2 => Authenticate,
    3 => Ping,
    4 => Reject,
    5 => ServerSync,
    6 => ChannelRemove,
    7 => ChannelState,
    8 => UserRemove,
    9 => UserState,
    10 => BanList,
    11 => TextMessage,
    12 => PermissionDenied,
    13 => ACL,
    14 => QueryUsers,
    15 => CryptSetup,
    16 => ContextActionModify,
    17 => ContextAction,
    18 => UserList,
    19 => VoiceTarget,
    20 => PermissionQuery,
    21 => CodecVersion,
    22 => UserStats,
    23 => RequestBlob,
    24 => ServerConfig,
    25 => SuggestConfig,
    26 => PluginDataTransmission,
}

/// A `Codec` implementation that parses a stream of data into [ControlPacket]s.
#[derive(Debug, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Creates a new control codec.
    pub fn new() -> Self {
        Default::default()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlPacket;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let kind = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
        if len > MAX_PAYLOAD_SIZE {
            return Err(invalid_data(format!("oversized control frame: {} bytes", len)));
        }
        if buf.len() < HEADER_SIZE + len {
            buf.reserve(HEADER_SIZE + len - buf.len());
            return Ok(None);
        }
        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        ControlPacket::parse(kind, payload).map(Some)
    }
}

impl Encoder<ControlPacket> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload()?;
        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u16(item.kind());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(packet: ControlPacket) -> ControlPacket {
        let mut codec = ControlCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(packet, &mut wire).unwrap();
        let out = codec.decode(&mut wire).unwrap().unwrap();
        assert!(wire.is_empty());
        out
    }

    #[test]
    fn version_roundtrip() {
        let mut msg = msgs::Version::new();
        msg.set_version_v1(0x0001_0400);
        msg.set_release("Grumble".to_owned());
        let packet: ControlPacket = msg.clone().into();
        assert_eq!(packet.kind(), 0);
        match roundtrip(packet) {
            ControlPacket::Version(out) => assert_eq!(*out, msg),
            other => panic!("unexpected packet: {}", other.name()),
        }
    }

    #[test]
    fn authenticate_roundtrip() {
        let mut msg = msgs::Authenticate::new();
        msg.set_username("Alice".to_owned());
        msg.set_opus(true);
        msg.mut_celt_versions().push(-2147483637);
        match roundtrip(msg.clone().into()) {
            ControlPacket::Authenticate(out) => assert_eq!(*out, msg),
            other => panic!("unexpected packet: {}", other.name()),
        }
    }

    #[test]
    fn tunnel_payload_passes_through_verbatim() {
        let datagram = Bytes::from_static(&[0x80, 1, 2, 3, 4]);
        let packet = ControlPacket::UDPTunnel(datagram.clone());
        assert_eq!(packet.kind(), 1);
        match roundtrip(packet) {
            ControlPacket::UDPTunnel(out) => assert_eq!(out, datagram),
            other => panic!("unexpected packet: {}", other.name()),
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = ControlCodec::new();
        let mut wire = BytesMut::new();
        let mut msg = msgs::Ping::new();
        msg.set_timestamp(42);
        codec
            .encode(msg.into(), &mut wire)
            .unwrap();

        let mut partial = BytesMut::from(&wire[..4]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&wire[..wire.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let mut codec = ControlCodec::new();
        let mut wire = BytesMut::new();
        wire.put_u16(999);
        wire.put_u32(0);
        assert!(codec.decode(&mut wire).is_err());
    }

    #[test]
    fn oversized_frame_is_a_protocol_error() {
        let mut codec = ControlCodec::new();
        let mut wire = BytesMut::new();
        wire.put_u16(3);
        wire.put_u32(0x0100_0000);
        assert!(codec.decode(&mut wire).is_err());
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut codec = ControlCodec::new();
        let mut wire = BytesMut::new();
        let mut ping = msgs::Ping::new();
        ping.set_timestamp(1);
        codec.encode(ping.into(), &mut wire).unwrap();
        codec
            .encode(ControlPacket::UDPTunnel(Bytes::from_static(b"x")), &mut wire)
            .unwrap();

        assert!(matches!(
            codec.decode(&mut wire).unwrap().unwrap(),
            ControlPacket::Ping(_)
        ));
        assert!(matches!(
            codec.decode(&mut wire).unwrap().unwrap(),
            ControlPacket::UDPTunnel(_)
        ));
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }
}
