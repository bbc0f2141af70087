use anyhow::{bail, ensure};
use bytes::{Buf, BytesMut};

use crate::{Decode, Packet, STRING_LEN};

/// Body size of each packet a client is allowed to send. Classic frames have
/// no length prefix; the id alone fixes the layout. Anything outside this
/// table is a protocol violation in every connection state.
fn inbound_body_len(id: u8) -> Option<usize> {
    match id {
        // version + username + verify key + padding byte
        0x00 => Some(2 + 2 * STRING_LEN),
        // x + y + z + mode + block
        0x05 => Some(8),
        // player id + x + y + z + yaw + pitch
        0x08 => Some(9),
        // player id + message
        0x0d => Some(1 + STRING_LEN),
        _ => None,
    }
}

/// Splits an inbound byte stream into [`PacketFrame`]s.
#[derive(Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next complete frame, or `None` if more data is needed.
    /// Fails when the leading byte is not an id a client may send.
    pub fn try_next_packet(&mut self) -> anyhow::Result<Option<PacketFrame>> {
        let Some(&id) = self.buf.first() else {
            return Ok(None);
        };

        let Some(body_len) = inbound_body_len(id) else {
            bail!("disallowed inbound packet id {id:#04x}");
        };

        if self.buf.len() < 1 + body_len {
            // Not enough data arrived yet.
            return Ok(None);
        }

        self.buf.advance(1);
        let body = self.buf.split_to(body_len);

        Ok(Some(PacketFrame { id, body }))
    }

    pub fn queue_bytes(&mut self, bytes: BytesMut) {
        self.buf.unsplit(bytes);
    }

    pub fn queue_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn take_capacity(&mut self) -> BytesMut {
        self.buf.split_off(self.buf.len())
    }

    pub fn reserve(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }
}

/// A complete inbound frame: the id byte and the fixed-size body that
/// followed it.
#[derive(Clone, Debug)]
pub struct PacketFrame {
    pub id: u8,
    pub body: BytesMut,
}

impl PacketFrame {
    /// Attempts to decode this frame as type `P`. An error is returned if the
    /// packet id does not match, the body failed to decode, or some input was
    /// missed.
    pub fn decode<'a, P>(&'a self) -> anyhow::Result<P>
    where
        P: Packet + Decode<'a>,
    {
        ensure!(
            P::ID == self.id,
            "packet id mismatch while decoding '{}': expected {:#04x}, got {:#04x}",
            P::NAME,
            P::ID,
            self.id
        );

        let mut r = &self.body[..];

        let pkt = P::decode(&mut r)?;

        ensure!(
            r.is_empty(),
            "missed {} bytes while decoding '{}'",
            r.len(),
            P::NAME
        );

        Ok(pkt)
    }
}
