use bytes::{BufMut, BytesMut};

use crate::{Encode, Packet};

/// Accumulates outbound packets, id bytes included, into one buffer.
#[derive(Default)]
pub struct PacketEncoder {
    buf: BytesMut,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_packet<P>(&mut self, pkt: &P) -> anyhow::Result<()>
    where
        P: Packet + Encode,
    {
        let start_len = self.buf.len();
        let mut writer = (&mut self.buf).writer();
        if let Err(e) = P::ID.encode(&mut writer).and_then(|()| pkt.encode(writer)) {
            self.buf.truncate(start_len);
            return Err(e);
        }
        Ok(())
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Takes all the packets written so far.
    pub fn take(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Encodes a single packet, id byte included, into a fresh buffer.
pub fn encode_packet<P>(pkt: &P) -> anyhow::Result<BytesMut>
where
    P: Packet + Encode,
{
    let mut enc = PacketEncoder::new();
    enc.append_packet(pkt)?;
    Ok(enc.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packets::{DespawnPlayerS2c, LevelInitS2c};
    use crate::PlayerId;

    #[test]
    fn id_byte_leads_every_packet() {
        let bytes = encode_packet(&DespawnPlayerS2c {
            player_id: PlayerId::Assigned(9),
        })
        .unwrap();
        assert_eq!(&bytes[..], &[0x0c, 9]);

        let bytes = encode_packet(&LevelInitS2c).unwrap();
        assert_eq!(&bytes[..], &[0x02]);
    }

    #[test]
    fn failed_append_leaves_buffer_untouched() {
        let mut enc = PacketEncoder::new();
        enc.append_packet(&LevelInitS2c).unwrap();
        let before = enc.buf.len();
        assert!(enc
            .append_packet(&DespawnPlayerS2c {
                player_id: PlayerId::Assigned(200),
            })
            .is_err());
        assert_eq!(enc.buf.len(), before);
    }
}
