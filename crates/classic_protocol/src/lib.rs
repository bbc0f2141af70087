//! Packet types and codecs for the Minecraft Classic 0.30 wire protocol.
//!
//! Classic frames carry no length prefix: every packet is a single id byte
//! followed by a body whose layout (and therefore size) is fixed by the id.
//! Integers are big-endian, strings are exactly 64 space-padded ASCII bytes,
//! and positions in movement packets are fixed-point with 32 units per block
//! cell.

pub mod decode;
pub mod encode;
pub mod packets;
mod types;

use std::io::Write;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub use crate::decode::{PacketDecoder, PacketFrame};
pub use crate::encode::{encode_packet, PacketEncoder};
pub use crate::types::{block_to_fixed, ClassicString, PlayerId};

/// The protocol version byte exchanged in the 0x00 handshake.
pub const PROTOCOL_VERSION: u8 = 0x07;

/// Wire length of every Classic string field.
pub const STRING_LEN: usize = 64;

/// Capacity of the payload field of one level-data chunk.
pub const LEVEL_CHUNK_LEN: usize = 1024;

/// Fixed-point units per block cell in spawn and movement packets.
pub const UNITS_PER_BLOCK: i32 = 32;

/// The `Encode` trait allows objects to be written to the Classic protocol.
/// It is the inverse of [`Decode`].
pub trait Encode {
    /// Writes this object to the provided writer.
    ///
    /// If this type also implements [`Decode`] then successful calls to this
    /// function returning `Ok(())` must always successfully [`decode`] using
    /// the data that was written to the writer.
    ///
    /// [`decode`]: Decode::decode
    fn encode(&self, w: impl Write) -> anyhow::Result<()>;
}

/// The `Decode` trait allows objects to be read from the Classic protocol.
/// It is the inverse of [`Encode`].
pub trait Decode<'a>: Sized {
    /// Reads this object from the provided byte slice, advancing the slice
    /// past the consumed bytes.
    fn decode(r: &mut &'a [u8]) -> anyhow::Result<Self>;
}

/// A complete packet: the id byte on the wire and the fixed-layout body that
/// follows it.
pub trait Packet {
    /// The leading id byte.
    const ID: u8;
    /// The name of this packet for error reporting.
    const NAME: &'static str;
}

impl Encode for u8 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u8(*self)?)
    }
}

impl Decode<'_> for u8 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u8()?)
    }
}

impl Encode for i8 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_i8(*self)?)
    }
}

impl Decode<'_> for i8 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_i8()?)
    }
}

impl Encode for u16 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_u16::<BigEndian>(*self)?)
    }
}

impl Decode<'_> for u16 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_u16::<BigEndian>()?)
    }
}

impl Encode for i16 {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        Ok(w.write_i16::<BigEndian>(*self)?)
    }
}

impl Decode<'_> for i16 {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(r.read_i16::<BigEndian>()?)
    }
}
