//! All packets of the Classic 0.30 protocol.
//!
//! Client-to-server packets carry the `C2s` suffix, server-to-client packets
//! the `S2c` suffix. The 0x00 and 0x08 ids are shared between directions with
//! different layouts or field meanings, so each direction gets its own type.

use std::io::Write;

use anyhow::ensure;

use crate::types::{ClassicString, PlayerId};
use crate::{Decode, Encode, Packet, LEVEL_CHUNK_LEN};

macro_rules! impl_packet {
    ($ty:ident, $id:literal) => {
        impl Packet for $ty {
            const ID: u8 = $id;
            const NAME: &'static str = stringify!($ty);
        }
    };
}

/// 0x00 (client). The first packet of every connection, identifying the
/// player. The verify key is accepted but not checked against any session
/// service.
#[derive(Clone, PartialEq, Debug)]
pub struct HandshakeC2s {
    pub protocol_version: u8,
    pub username: ClassicString,
    pub verify_key: ClassicString,
    pub unused: u8,
}

impl_packet!(HandshakeC2s, 0x00);

impl Encode for HandshakeC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.protocol_version.encode(&mut w)?;
        self.username.encode(&mut w)?;
        self.verify_key.encode(&mut w)?;
        self.unused.encode(&mut w)
    }
}

impl Decode<'_> for HandshakeC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            protocol_version: u8::decode(r)?,
            username: ClassicString::decode(r)?,
            verify_key: ClassicString::decode(r)?,
            unused: u8::decode(r)?,
        })
    }
}

/// 0x00 (server). Identifies the server in response to the handshake.
#[derive(Clone, PartialEq, Debug)]
pub struct ServerIdentS2c {
    pub protocol_version: u8,
    pub server_name: ClassicString,
    pub motd: ClassicString,
    pub user_type: u8,
}

impl_packet!(ServerIdentS2c, 0x00);

impl Encode for ServerIdentS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.protocol_version.encode(&mut w)?;
        self.server_name.encode(&mut w)?;
        self.motd.encode(&mut w)?;
        self.user_type.encode(&mut w)
    }
}

impl Decode<'_> for ServerIdentS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            protocol_version: u8::decode(r)?,
            server_name: ClassicString::decode(r)?,
            motd: ClassicString::decode(r)?,
            user_type: u8::decode(r)?,
        })
    }
}

/// 0x02. Announces the start of the level stream.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LevelInitS2c;

impl_packet!(LevelInitS2c, 0x02);

impl Encode for LevelInitS2c {
    fn encode(&self, _w: impl Write) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Decode<'_> for LevelInitS2c {
    fn decode(_r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

/// 0x03. One chunk of the gzipped level payload. The payload field is always
/// 1024 bytes on the wire, zero-padded past `data.len()`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LevelDataS2c {
    pub data: Vec<u8>,
    /// Completion percentage, non-decreasing over the stream; 100 marks the
    /// final chunk.
    pub percent: u8,
}

impl_packet!(LevelDataS2c, 0x03);

impl Encode for LevelDataS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        const ZEROS: [u8; LEVEL_CHUNK_LEN] = [0; LEVEL_CHUNK_LEN];

        ensure!(
            self.data.len() <= LEVEL_CHUNK_LEN,
            "level chunk of {} bytes exceeds the {LEVEL_CHUNK_LEN}-byte limit",
            self.data.len()
        );
        (self.data.len() as u16).encode(&mut w)?;
        w.write_all(&self.data)?;
        w.write_all(&ZEROS[self.data.len()..])?;
        self.percent.encode(&mut w)
    }
}

impl Decode<'_> for LevelDataS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        let len = usize::from(u16::decode(r)?);
        ensure!(
            len <= LEVEL_CHUNK_LEN,
            "level chunk of {len} bytes exceeds the {LEVEL_CHUNK_LEN}-byte limit"
        );
        ensure!(
            r.len() >= LEVEL_CHUNK_LEN,
            "not enough data remaining to decode a level chunk"
        );
        let (payload, remaining) = r.split_at(LEVEL_CHUNK_LEN);
        *r = remaining;
        Ok(Self {
            data: payload[..len].to_vec(),
            percent: u8::decode(r)?,
        })
    }
}

/// 0x04. Ends the level stream and reports the world dimensions.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct LevelFinalizeS2c {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl_packet!(LevelFinalizeS2c, 0x04);

impl Encode for LevelFinalizeS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)
    }
}

impl Decode<'_> for LevelFinalizeS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
        })
    }
}

/// 0x05 (client). Places (`mode` 1) or destroys (`mode` 0) a block at a block
/// coordinate.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SetBlockC2s {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub mode: u8,
    pub block: u8,
}

impl_packet!(SetBlockC2s, 0x05);

impl Encode for SetBlockC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)?;
        self.mode.encode(&mut w)?;
        self.block.encode(&mut w)
    }
}

impl Decode<'_> for SetBlockC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
            mode: u8::decode(r)?,
            block: u8::decode(r)?,
        })
    }
}

/// 0x06 (server). Announces one block mutation to every peer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockUpdateS2c {
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub block: u8,
}

impl_packet!(BlockUpdateS2c, 0x06);

impl Encode for BlockUpdateS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)?;
        self.block.encode(&mut w)
    }
}

impl Decode<'_> for BlockUpdateS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
            block: u8::decode(r)?,
        })
    }
}

/// 0x07 (server). Spawns a named player at a fixed-point position.
/// [`PlayerId::Own`] spawns the recipient's own player.
#[derive(Clone, PartialEq, Debug)]
pub struct SpawnPlayerS2c {
    pub player_id: PlayerId,
    pub name: ClassicString,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub yaw: u8,
    pub pitch: u8,
}

impl_packet!(SpawnPlayerS2c, 0x07);

impl Encode for SpawnPlayerS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)?;
        self.name.encode(&mut w)?;
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)?;
        self.yaw.encode(&mut w)?;
        self.pitch.encode(&mut w)
    }
}

impl Decode<'_> for SpawnPlayerS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: PlayerId::decode(r)?,
            name: ClassicString::decode(r)?,
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
            yaw: u8::decode(r)?,
            pitch: u8::decode(r)?,
        })
    }
}

/// 0x08 (client). The sender's position and orientation. The id byte clients
/// send for themselves is untrusted and ignored, so it is kept as a raw byte
/// rather than a validated [`PlayerId`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PositionC2s {
    pub player_id: u8,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub yaw: u8,
    pub pitch: u8,
}

impl_packet!(PositionC2s, 0x08);

impl Encode for PositionC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)?;
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)?;
        self.yaw.encode(&mut w)?;
        self.pitch.encode(&mut w)
    }
}

impl Decode<'_> for PositionC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: u8::decode(r)?,
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
            yaw: u8::decode(r)?,
            pitch: u8::decode(r)?,
        })
    }
}

/// 0x08 (server). Moves a player, or teleports the recipient when the id is
/// [`PlayerId::Own`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct PositionS2c {
    pub player_id: PlayerId,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub yaw: u8,
    pub pitch: u8,
}

impl_packet!(PositionS2c, 0x08);

impl Encode for PositionS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)?;
        self.x.encode(&mut w)?;
        self.y.encode(&mut w)?;
        self.z.encode(&mut w)?;
        self.yaw.encode(&mut w)?;
        self.pitch.encode(&mut w)
    }
}

impl Decode<'_> for PositionS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: PlayerId::decode(r)?,
            x: i16::decode(r)?,
            y: i16::decode(r)?,
            z: i16::decode(r)?,
            yaw: u8::decode(r)?,
            pitch: u8::decode(r)?,
        })
    }
}

/// 0x0c (server). Removes a player from the recipient's world.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DespawnPlayerS2c {
    pub player_id: PlayerId,
}

impl_packet!(DespawnPlayerS2c, 0x0c);

impl Encode for DespawnPlayerS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)
    }
}

impl Decode<'_> for DespawnPlayerS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: PlayerId::decode(r)?,
        })
    }
}

/// 0x0d (client). A chat line or slash command.
#[derive(Clone, PartialEq, Debug)]
pub struct ChatMessageC2s {
    pub player_id: u8,
    pub message: ClassicString,
}

impl_packet!(ChatMessageC2s, 0x0d);

impl Encode for ChatMessageC2s {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)?;
        self.message.encode(&mut w)
    }
}

impl Decode<'_> for ChatMessageC2s {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: u8::decode(r)?,
            message: ClassicString::decode(r)?,
        })
    }
}

/// 0x0d (server). A chat line. The server speaks with the [`PlayerId::Own`]
/// sentinel as sender.
#[derive(Clone, PartialEq, Debug)]
pub struct ChatMessageS2c {
    pub player_id: PlayerId,
    pub message: ClassicString,
}

impl_packet!(ChatMessageS2c, 0x0d);

impl Encode for ChatMessageS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.player_id.encode(&mut w)?;
        self.message.encode(&mut w)
    }
}

impl Decode<'_> for ChatMessageS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            player_id: PlayerId::decode(r)?,
            message: ClassicString::decode(r)?,
        })
    }
}

/// 0x0e (server). Disconnects the recipient with a reason line.
#[derive(Clone, PartialEq, Debug)]
pub struct DisconnectS2c {
    pub reason: ClassicString,
}

impl_packet!(DisconnectS2c, 0x0e);

impl Encode for DisconnectS2c {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        self.reason.encode(&mut w)
    }
}

impl Decode<'_> for DisconnectS2c {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            reason: ClassicString::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<P>(pkt: &P)
    where
        P: Encode + for<'a> Decode<'a> + PartialEq + std::fmt::Debug,
    {
        let mut buf = vec![];
        pkt.encode(&mut buf).unwrap();
        let mut r = &buf[..];
        let decoded = P::decode(&mut r).unwrap();
        assert!(r.is_empty(), "{} bytes left over", r.len());
        assert_eq!(&decoded, pkt);
    }

    #[test]
    fn packet_bodies_roundtrip() {
        roundtrip(&HandshakeC2s {
            protocol_version: 0x07,
            username: ClassicString::new("Alice").unwrap(),
            verify_key: ClassicString::default(),
            unused: 0,
        });
        roundtrip(&ServerIdentS2c {
            protocol_version: 0x07,
            server_name: ClassicString::new("RLE Server").unwrap(),
            motd: ClassicString::new("Direct-Stream").unwrap(),
            user_type: 0,
        });
        roundtrip(&LevelInitS2c);
        roundtrip(&LevelDataS2c {
            data: vec![0xab; 300],
            percent: 42,
        });
        roundtrip(&LevelFinalizeS2c { x: 128, y: 64, z: 128 });
        roundtrip(&SetBlockC2s {
            x: 5,
            y: 1,
            z: 5,
            mode: 1,
            block: 2,
        });
        roundtrip(&BlockUpdateS2c {
            x: 5,
            y: 1,
            z: 5,
            block: 2,
        });
        roundtrip(&SpawnPlayerS2c {
            player_id: PlayerId::Own,
            name: ClassicString::new("Alice").unwrap(),
            x: 16384,
            y: 2240,
            z: 16384,
            yaw: 0,
            pitch: 0,
        });
        roundtrip(&PositionC2s {
            player_id: 0,
            x: -3200,
            y: 2240,
            z: 3200,
            yaw: 90,
            pitch: 180,
        });
        roundtrip(&PositionS2c {
            player_id: PlayerId::Assigned(17),
            x: -3200,
            y: 2240,
            z: 3200,
            yaw: 90,
            pitch: 180,
        });
        roundtrip(&DespawnPlayerS2c {
            player_id: PlayerId::Assigned(3),
        });
        roundtrip(&ChatMessageC2s {
            player_id: 0xff,
            message: ClassicString::new("/login hunter2").unwrap(),
        });
        roundtrip(&ChatMessageS2c {
            player_id: PlayerId::Own,
            message: ClassicString::new("&eAlice joined the game").unwrap(),
        });
        roundtrip(&DisconnectS2c {
            reason: ClassicString::new("Kicked for reason: Triggered Anti Grief. Slow down!")
                .unwrap(),
        });
    }

    #[test]
    fn level_chunk_is_padded_to_full_width() {
        let pkt = LevelDataS2c {
            data: vec![1, 2, 3],
            percent: 7,
        };
        let mut buf = vec![];
        pkt.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 2 + LEVEL_CHUNK_LEN + 1);
        assert_eq!(&buf[..2], &[0, 3]);
        assert_eq!(&buf[2..5], &[1, 2, 3]);
        assert!(buf[5..2 + LEVEL_CHUNK_LEN].iter().all(|&b| b == 0));
        assert_eq!(buf[2 + LEVEL_CHUNK_LEN], 7);
    }

    #[test]
    fn oversize_level_chunk_is_rejected() {
        let pkt = LevelDataS2c {
            data: vec![0; LEVEL_CHUNK_LEN + 1],
            percent: 0,
        };
        assert!(pkt.encode(&mut vec![]).is_err());
    }
}
