use std::fmt;
use std::io::Write;

use anyhow::{bail, ensure};
use byteorder::{ReadBytesExt, WriteBytesExt};

use crate::{Decode, Encode, STRING_LEN, UNITS_PER_BLOCK};

const PADDING: [u8; STRING_LEN] = [b' '; STRING_LEN];

/// A Classic protocol string: at most 64 bytes of ASCII, space-padded to
/// exactly 64 bytes on the wire and space-trimmed when read back.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct ClassicString(String);

impl ClassicString {
    /// Validates that `s` fits one wire string field.
    pub fn new(s: impl Into<String>) -> anyhow::Result<Self> {
        let s = s.into();
        ensure!(
            s.len() <= STRING_LEN,
            "string of {} bytes exceeds the {STRING_LEN}-byte wire limit",
            s.len()
        );
        ensure!(s.is_ascii(), "string contains non-ASCII data");
        Ok(Self(s))
    }

    /// Builds a wire string from arbitrary text, truncating to 64 bytes and
    /// replacing non-ASCII characters with `?`.
    pub fn lossy(s: &str) -> Self {
        let mut out: String = s
            .chars()
            .map(|c| if c.is_ascii() { c } else { '?' })
            .collect();
        out.truncate(STRING_LEN);
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ClassicString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for ClassicString {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> anyhow::Result<Self> {
        Self::new(s)
    }
}

impl Encode for ClassicString {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        ensure!(
            self.0.len() <= STRING_LEN,
            "string of {} bytes exceeds the {STRING_LEN}-byte wire limit",
            self.0.len()
        );
        w.write_all(self.0.as_bytes())?;
        w.write_all(&PADDING[self.0.len()..])?;
        Ok(())
    }
}

impl Decode<'_> for ClassicString {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        ensure!(
            r.len() >= STRING_LEN,
            "not enough data remaining to decode a {STRING_LEN}-byte string"
        );
        let (raw, remaining) = r.split_at(STRING_LEN);
        ensure!(raw.is_ascii(), "string contains non-ASCII data");
        *r = remaining;
        let text = std::str::from_utf8(raw)?.trim_matches(' ');
        Ok(Self(text.to_owned()))
    }
}

/// A player id on the wire: a signed byte where `-1` refers to the receiving
/// player themselves in spawn and movement packets, and to the server in chat
/// packets. Assigned ids are always in `0..128`, so 255 never appears as an
/// unsigned interpretation.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PlayerId {
    /// The `-1` sentinel.
    Own,
    Assigned(u8),
}

impl Encode for PlayerId {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match *self {
            Self::Own => Ok(w.write_i8(-1)?),
            Self::Assigned(id) => {
                ensure!(id < 128, "assigned player id {id} out of range");
                Ok(w.write_i8(id as i8)?)
            }
        }
    }
}

impl Decode<'_> for PlayerId {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        match r.read_i8()? {
            -1 => Ok(Self::Own),
            id @ 0..=127 => Ok(Self::Assigned(id as u8)),
            id => bail!("invalid player id byte {id}"),
        }
    }
}

/// Converts a block coordinate to fixed-point wire units, clamping into the
/// representable `i16` envelope.
pub fn block_to_fixed(block: i32) -> i16 {
    (block * UNITS_PER_BLOCK).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(s: &ClassicString) -> ClassicString {
        let mut buf = vec![];
        s.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), STRING_LEN);
        ClassicString::decode(&mut &buf[..]).unwrap()
    }

    #[test]
    fn string_pads_and_trims() {
        let s = ClassicString::new("Alice").unwrap();
        assert_eq!(roundtrip(&s), s);

        let mut buf = vec![];
        s.encode(&mut buf).unwrap();
        assert_eq!(&buf[..5], b"Alice");
        assert!(buf[5..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn string_rejects_oversize_and_non_ascii() {
        assert!(ClassicString::new("x".repeat(65)).is_err());
        assert!(ClassicString::new("héllo").is_err());
    }

    #[test]
    fn lossy_truncates_and_replaces() {
        let s = ClassicString::lossy(&"é".repeat(100));
        assert_eq!(s.as_str(), "?".repeat(64));
    }

    #[test]
    fn player_id_wire_values() {
        let mut buf = vec![];
        PlayerId::Own.encode(&mut buf).unwrap();
        PlayerId::Assigned(127).encode(&mut buf).unwrap();
        assert_eq!(buf, [0xff, 127]);

        assert_eq!(PlayerId::decode(&mut &buf[..1]).unwrap(), PlayerId::Own);
        assert!(PlayerId::Assigned(128).encode(&mut vec![]).is_err());
        assert!(PlayerId::decode(&mut &[0x80_u8][..]).is_err());
    }

    #[test]
    fn fixed_point_clamps_to_wire_envelope() {
        assert_eq!(block_to_fixed(10), 320);
        assert_eq!(block_to_fixed(2560), i16::MAX);
        assert_eq!(block_to_fixed(-2560), i16::MIN);
    }
}
