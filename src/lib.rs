//! Mumble-compatible voice chat server.
//!
//! The protocol plane lives in the top-level modules: [control] for the
//! reliable TLS channel, [voice] and [crypt] for the encrypted datagram
//! channel, [ping] for the unauthenticated server-query datagrams. The
//! server itself (channel tree, clients, routing) lives under [server].

#![warn(clippy::all)]

pub mod control;
pub mod crypt;
pub mod packetbuf;
pub mod ping;
pub mod server;
pub mod varint;
pub mod voice;

#[allow(non_snake_case)]
pub mod msgs {
    //! Generated protobuf message types: the control channel schema, the
    //! length-delimited datagram schema and the on-disk snapshot schema.
    include!(concat!(env!("OUT_DIR"), "/proto/mod.rs"));
}

pub use voice::AudioPacket;
pub use voice::UdpPacket;
