//! On-disk storage for a fixed-size block volume.
//!
//! The world lives in a single run-length encoded file: a flat sequence of
//! `(count, block)` byte pairs whose concatenated expansion is the volume in
//! index order. Mutations never touch the file directly; they land in an
//! in-memory [`EditLog`] that readers overlay on the expansion, and a
//! compaction pass periodically merges the log into a rewritten file under a
//! bounded memory ceiling.

mod edit_log;
mod rle;
mod store;

use thiserror::Error;

pub use crate::edit_log::EditLog;
pub use crate::rle::{cumulative_ends, RleEncoder, RunReader, RunWriter, MAX_RUN};
pub use crate::store::{LevelSink, WorldStore, DEFAULT_COMPACT_CHUNK};

/// Block id of empty space.
pub const AIR: u8 = 0;

/// Block id the generator fills the lower half of a fresh world with.
pub const GRASS: u8 = 2;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorldError {
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
    #[error("run-length data ends in the middle of a pair")]
    TruncatedRun,
    #[error("run-length data contains a zero-length run")]
    ZeroRun,
    #[error("world file expands to {actual} cells, expected {expected}")]
    BadExpansion { actual: u64, expected: u64 },
    #[error("axis extent {0} cannot be expressed by the wire protocol")]
    AxisTooLarge(u16),
    #[error("world of {0} cells does not fit the level stream header")]
    WorldTooLarge(u64),
}

/// The extent of the block volume on each axis.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Dimensions {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl Dimensions {
    pub fn new(x: u16, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }

    /// Total number of cells.
    pub fn volume(self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    /// Linear index of a coordinate, or `None` when out of bounds.
    ///
    /// The index order is `(y * Z + z) * X + x`: full horizontal slabs stack
    /// bottom-up, so the lower half of the index space is the lower half of
    /// the world.
    pub fn index(self, x: i16, y: i16, z: i16) -> Option<u64> {
        if x < 0 || y < 0 || z < 0 {
            return None;
        }
        let (x, y, z) = (x as u64, y as u64, z as u64);
        if x >= u64::from(self.x) || y >= u64::from(self.y) || z >= u64::from(self.z) {
            return None;
        }
        Some((y * u64::from(self.z) + z) * u64::from(self.x) + x)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn index_is_a_bijection_on_valid_coordinates() {
        let dims = Dimensions::new(5, 3, 4);
        let mut seen = HashSet::new();
        for y in 0..3 {
            for z in 0..4 {
                for x in 0..5 {
                    let index = dims.index(x, y, z).unwrap();
                    assert!(index < dims.volume());
                    assert!(seen.insert(index));
                }
            }
        }
        assert_eq!(seen.len() as u64, dims.volume());
    }

    #[test]
    fn out_of_bounds_coordinates_have_no_index() {
        let dims = Dimensions::new(5, 3, 4);
        assert_eq!(dims.index(-1, 0, 0), None);
        assert_eq!(dims.index(5, 0, 0), None);
        assert_eq!(dims.index(0, 3, 0), None);
        assert_eq!(dims.index(0, 0, 4), None);
        assert_eq!(dims.index(4, 2, 3), Some(dims.volume() - 1));
    }
}
