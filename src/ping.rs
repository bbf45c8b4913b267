//! Server-query ping packets.
//!
//! Anyone may send a bare 12-byte datagram to the voice port to query a
//! server's state and measure latency; no connection or crypto is involved.
//! The server answers with a fixed 24-byte [PongPacket] carrying its
//! version and occupancy details.
//!
//! Both packets are of fixed size and can be converted to/from `u8`
//! arrays/slices via the respective `From`/`TryFrom` impls.

use std::convert::TryFrom;
use std::convert::TryInto;

/// A ping packet sent by a prospective client.
#[derive(Clone, Debug, PartialEq)]
pub struct PingPacket {
    /// Opaque, client-generated id.
    ///
    /// Echoed back unmodified so the client can correlate pong replies to
    /// ping requests. The server must not try to make sense of it.
    pub id: u64,
}

/// The reply to a previously received [PingPacket].
#[derive(Clone, Debug, PartialEq)]
pub struct PongPacket {
    /// Opaque id copied from the corresponding [PingPacket].
    pub id: u64,

    /// Server version. E.g. `0x010400` for `1.4.0`.
    pub version: u32,

    /// Current amount of users connected to the server.
    pub users: u32,

    /// Configured limit on the amount of users which can be connected.
    pub max_users: u32,

    /// Maximum bandwidth for server-bound speech per client in bits per
    /// second.
    pub bandwidth: u32,
}

/// Error during parsing of a [PingPacket].
#[derive(Clone, Debug, PartialEq)]
pub enum ParsePingError {
    /// Ping packets must always be 12 bytes in size.
    InvalidSize,
    /// Ping packets must have an all zero header of 4 bytes.
    InvalidHeader,
}

impl TryFrom<&[u8]> for PingPacket {
    type Error = ParsePingError;
    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        match <[u8; 12]>::try_from(buf) {
            Ok(array) => {
                if array[0..4] != [0, 0, 0, 0] {
                    Err(ParsePingError::InvalidHeader)
                } else {
                    Ok(Self {
                        id: u64::from_be_bytes(array[4..12].try_into().unwrap()),
                    })
                }
            }
            Err(_) => Err(ParsePingError::InvalidSize),
        }
    }
}

impl From<PingPacket> for [u8; 12] {
    fn from(packet: PingPacket) -> Self {
        let mut out = [0; 12];
        out[4..12].copy_from_slice(&packet.id.to_be_bytes());
        out
    }
}

/// Error during parsing of a [PongPacket].
#[derive(Clone, Debug, PartialEq)]
pub enum ParsePongError {
    /// Pong packets must always be 24 bytes in size.
    InvalidSize,
}

impl TryFrom<&[u8]> for PongPacket {
    type Error = ParsePongError;
    fn try_from(buf: &[u8]) -> Result<Self, Self::Error> {
        match <[u8; 24]>::try_from(buf) {
            Ok(array) => Ok(Self {
                version: u32::from_be_bytes(array[0..4].try_into().unwrap()),
                id: u64::from_be_bytes(array[4..12].try_into().unwrap()),
                users: u32::from_be_bytes(array[12..16].try_into().unwrap()),
                max_users: u32::from_be_bytes(array[16..20].try_into().unwrap()),
                bandwidth: u32::from_be_bytes(array[20..24].try_into().unwrap()),
            }),
            Err(_) => Err(ParsePongError::InvalidSize),
        }
    }
}

impl From<PongPacket> for [u8; 24] {
    fn from(packet: PongPacket) -> Self {
        let mut out = [0; 24];
        out[0..4].copy_from_slice(&packet.version.to_be_bytes());
        out[4..12].copy_from_slice(&packet.id.to_be_bytes());
        out[12..16].copy_from_slice(&packet.users.to_be_bytes());
        out[16..20].copy_from_slice(&packet.max_users.to_be_bytes());
        out[20..24].copy_from_slice(&packet.bandwidth.to_be_bytes());
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ping_parses_and_reply_echoes_id() {
        let mut datagram = [0u8; 12];
        datagram[4..].copy_from_slice(&0xdead_beef_0123_4567u64.to_be_bytes());
        let ping = PingPacket::try_from(&datagram[..]).unwrap();
        assert_eq!(ping.id, 0xdead_beef_0123_4567);

        let pong = PongPacket {
            id: ping.id,
            version: 0x0001_0400,
            users: 3,
            max_users: 100,
            bandwidth: 72_000,
        };
        let reply: [u8; 24] = pong.clone().into();
        // The opaque id bytes come back verbatim.
        assert_eq!(&reply[4..12], &datagram[4..12]);
        assert_eq!(PongPacket::try_from(&reply[..]).unwrap(), pong);
    }

    #[test]
    fn ping_requires_zero_header() {
        let mut datagram = [0u8; 12];
        datagram[0] = 1;
        assert_eq!(
            PingPacket::try_from(&datagram[..]),
            Err(ParsePingError::InvalidHeader)
        );
    }

    #[test]
    fn ping_requires_exact_size() {
        assert_eq!(
            PingPacket::try_from(&[0u8; 11][..]),
            Err(ParsePingError::InvalidSize)
        );
        assert_eq!(
            PingPacket::try_from(&[0u8; 13][..]),
            Err(ParsePingError::InvalidSize)
        );
    }
}
