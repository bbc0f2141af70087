//! The world store: the RLE file overlaid with the edit log.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use crate::edit_log::EditLog;
use crate::rle::{cumulative_ends, RleEncoder, RunReader, RunWriter, MAX_RUN};
use crate::{Dimensions, WorldError, AIR, GRASS};

/// Cells materialized per compaction window.
pub const DEFAULT_COMPACT_CHUNK: u64 = 50_000_000;

/// Payload bytes per delivered level chunk, matching the level-data packet.
const SINK_CHUNK_LEN: usize = 1024;

/// Receives the gzipped level payload in wire-sized chunks.
pub trait LevelSink {
    /// Delivers one chunk of at most 1024 bytes together with a
    /// non-decreasing completion percentage. The final chunk always reports
    /// 100.
    fn chunk(&mut self, data: &[u8], percent: u8) -> io::Result<()>;
}

/// A fixed-size block volume backed by a run-length encoded file plus an
/// in-memory log of unmerged edits.
///
/// Only [`compact`](Self::compact) writes the file, and it does so through a
/// temp-file-and-rename swap, so concurrent level streams keep reading a
/// consistent snapshot through their already-open handle.
pub struct WorldStore {
    dims: Dimensions,
    path: PathBuf,
    edits: EditLog,
    compact_chunk: u64,
}

impl WorldStore {
    /// Opens the store, generating a fresh world file if none exists. An
    /// existing file must expand to exactly the configured volume.
    pub fn open(
        path: impl Into<PathBuf>,
        dims: Dimensions,
        compact_chunk: u64,
    ) -> Result<Self, WorldError> {
        for axis in [dims.x, dims.y, dims.z] {
            if axis > i16::MAX as u16 {
                return Err(WorldError::AxisTooLarge(axis));
            }
        }
        let volume = dims.volume();
        if volume > u64::from(u32::MAX) {
            return Err(WorldError::WorldTooLarge(volume));
        }

        let path = path.into();
        if path.exists() {
            let expanded = Self::scan(&path)?;
            if expanded != volume {
                return Err(WorldError::BadExpansion {
                    actual: expanded,
                    expected: volume,
                });
            }
        } else {
            Self::generate(&path, volume)?;
            info!(path = %path.display(), cells = volume, "generated initial world file");
        }

        Ok(Self {
            dims,
            path,
            edits: EditLog::new(),
            compact_chunk: compact_chunk.max(1),
        })
    }

    pub fn dims(&self) -> Dimensions {
        self.dims
    }

    /// Number of edits not yet merged to disk.
    pub fn pending_edits(&self) -> usize {
        self.edits.len()
    }

    /// Records a block edit. Out-of-bounds coordinates are dropped and
    /// reported with `false`.
    pub fn set_block(&self, x: i16, y: i16, z: i16, block: u8) -> bool {
        let Some(index) = self.dims.index(x, y, z) else {
            debug!(x, y, z, "dropping out-of-bounds block edit");
            return false;
        };
        self.edits.put(index, block);
        true
    }

    /// Streams the gzipped level payload into `sink`: a 4-byte big-endian
    /// cell count followed by the expansion of the world file with pending
    /// edits overlaid. The volume is never materialized; runs flow straight
    /// through the gzip encoder into ≤1024-byte chunks.
    pub fn stream_level(&self, sink: &mut dyn LevelSink) -> Result<(), WorldError> {
        let volume = self.dims.volume();
        let file = File::open(&self.path)?;

        let mut overlay: Vec<(u64, u8)> = self.edits.snapshot().into_iter().collect();
        overlay.sort_unstable_by_key(|&(index, _)| index);
        let mut overlay = overlay.into_iter().peekable();

        let chunker = ChunkWriter {
            sink,
            queued: Vec::with_capacity(2 * SINK_CHUNK_LEN),
            sent: 0,
            volume,
        };
        let mut gz = GzEncoder::new(chunker, Compression::new(6));
        gz.write_u32::<BigEndian>(volume as u32)?;

        let mut runs = RunReader::new(BufReader::new(file));
        let mut index = 0_u64;
        let mut cells = [0_u8; MAX_RUN as usize];
        while let Some((count, block)) = runs.next_run()? {
            let count = u64::from(count);
            let run = &mut cells[..count as usize];
            run.fill(block);
            while let Some(&(edit_index, edit_block)) = overlay.peek() {
                if edit_index >= index + count {
                    break;
                }
                run[(edit_index - index) as usize] = edit_block;
                overlay.next();
            }
            gz.write_all(run)?;
            index += count;
        }
        if index != volume {
            return Err(WorldError::BadExpansion {
                actual: index,
                expected: volume,
            });
        }

        gz.finish()?.finish()?;
        Ok(())
    }

    /// Merges pending edits into the world file, materializing at most
    /// `compact_chunk` cells at a time, and returns the number of merged
    /// edits. The rewritten file replaces the live one atomically; on any
    /// failure the live file and the edit log are left untouched so the next
    /// pass can retry. Edits arriving while the merge runs stay in the log.
    pub fn compact(&self) -> Result<usize, WorldError> {
        let snapshot = self.edits.snapshot();
        if snapshot.is_empty() {
            return Ok(0);
        }
        let mut pending = snapshot.clone();

        let volume = self.dims.volume();
        let raw = fs::read(&self.path)?;
        if raw.len() % 2 != 0 {
            return Err(WorldError::TruncatedRun);
        }
        let counts: Vec<u8> = raw.iter().step_by(2).copied().collect();
        let vals: Vec<u8> = raw.iter().skip(1).step_by(2).copied().collect();
        let cum = cumulative_ends(&counts);
        if cum.last().copied().unwrap_or(0) != volume {
            return Err(WorldError::BadExpansion {
                actual: cum.last().copied().unwrap_or(0),
                expected: volume,
            });
        }

        let tmp_path = self.tmp_path();
        let mut enc = RleEncoder::new(BufWriter::new(File::create(&tmp_path)?));

        let mut window = Vec::new();
        let mut start = 0_u64;
        while start < volume {
            let end = (start + self.compact_chunk).min(volume);

            // First run ending past `start`, last run reaching `end`.
            let first = cum.partition_point(|&run_end| run_end <= start);
            let last = cum.partition_point(|&run_end| run_end < end);

            window.clear();
            window.reserve((end - start) as usize);
            for i in first..=last {
                let run_start = if i == 0 { 0 } else { cum[i - 1] };
                let kept = (cum[i].min(end) - run_start.max(start)) as usize;
                let filled = window.len();
                window.resize(filled + kept, vals[i]);
            }
            debug_assert_eq!(window.len() as u64, end - start);

            let keys: Vec<u64> = pending
                .keys()
                .copied()
                .filter(|&key| key >= start && key < end)
                .collect();
            for key in keys {
                if let Some(block) = pending.remove(&key) {
                    window[(key - start) as usize] = block;
                }
            }

            enc.push_slice(&window)?;
            start = end;
        }

        let mut out = enc.finish()?;
        out.flush()?;
        let file = out.into_inner().map_err(|e| WorldError::Io(e.into_error()))?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        // Only the snapshot's consumed keys leave the log; anything written
        // after the snapshot rolls into the next cycle.
        let consumed: std::collections::HashMap<u64, u8> = snapshot
            .into_iter()
            .filter(|(key, _)| !pending.contains_key(key))
            .collect();
        let merged = consumed.len();
        self.edits.remove_merged(&consumed);

        debug!(merged, "compaction pass complete");
        Ok(merged)
    }

    fn scan(path: &Path) -> Result<u64, WorldError> {
        let mut runs = RunReader::new(BufReader::new(File::open(path)?));
        let mut total = 0_u64;
        while let Some((count, _)) = runs.next_run()? {
            total += u64::from(count);
        }
        Ok(total)
    }

    fn generate(path: &Path, volume: u64) -> Result<(), WorldError> {
        let mut out = RunWriter::new(BufWriter::new(File::create(path)?));
        let half = volume / 2;
        out.write_run(half, GRASS)?;
        out.write_run(volume - half, AIR)?;
        out.into_inner().flush()?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tmp.into()
    }
}

/// `Write` adapter that slices the compressed stream into wire-sized chunks.
///
/// The percentage mirrors compressed progress against the uncompressed total
/// and is capped at 99 so only the final chunk, emitted by
/// [`finish`](Self::finish), reports 100.
struct ChunkWriter<'a> {
    sink: &'a mut dyn LevelSink,
    queued: Vec<u8>,
    sent: u64,
    volume: u64,
}

impl ChunkWriter<'_> {
    fn percent(&self) -> u8 {
        ((self.sent * 100) / self.volume.max(1)).min(99) as u8
    }

    fn finish(mut self) -> io::Result<()> {
        // `write` always leaves at least one byte queued, so the 100% marker
        // has a chunk to ride on.
        self.sent += self.queued.len() as u64;
        let data = std::mem::take(&mut self.queued);
        self.sink.chunk(&data, 100)
    }
}

impl Write for ChunkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.queued.extend_from_slice(buf);
        while self.queued.len() > SINK_CHUNK_LEN {
            let rest = self.queued.split_off(SINK_CHUNK_LEN);
            let full = std::mem::replace(&mut self.queued, rest);
            self.sent += full.len() as u64;
            let percent = self.percent();
            self.sink.chunk(&full, percent)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    struct CollectSink {
        chunks: Vec<(Vec<u8>, u8)>,
    }

    impl LevelSink for CollectSink {
        fn chunk(&mut self, data: &[u8], percent: u8) -> io::Result<()> {
            self.chunks.push((data.to_vec(), percent));
            Ok(())
        }
    }

    fn decode_level(store: &WorldStore) -> (u32, Vec<u8>) {
        let mut sink = CollectSink { chunks: vec![] };
        store.stream_level(&mut sink).unwrap();

        assert!(!sink.chunks.is_empty());
        for (data, _) in &sink.chunks {
            assert!(data.len() <= 1024);
        }
        let percents: Vec<u8> = sink.chunks.iter().map(|&(_, p)| p).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*percents.last().unwrap(), 100);

        let gz: Vec<u8> = sink.chunks.into_iter().flat_map(|(data, _)| data).collect();
        let mut raw = vec![];
        GzDecoder::new(&gz[..]).read_to_end(&mut raw).unwrap();
        assert!(raw.len() >= 4);
        let header = u32::from_be_bytes(raw[..4].try_into().unwrap());
        (header, raw.split_off(4))
    }

    fn open_store(dir: &tempfile::TempDir, dims: Dimensions, compact_chunk: u64) -> WorldStore {
        WorldStore::open(dir.path().join("world.rle"), dims, compact_chunk).unwrap()
    }

    #[test]
    fn fresh_world_is_half_grass_half_air() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Dimensions::new(8, 4, 8), DEFAULT_COMPACT_CHUNK);

        let (header, cells) = decode_level(&store);
        assert_eq!(header, 256);
        assert_eq!(cells.len(), 256);
        assert!(cells[..128].iter().all(|&b| b == GRASS));
        assert!(cells[128..].iter().all(|&b| b == AIR));
    }

    #[test]
    fn pending_edits_overlay_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, Dimensions::new(8, 4, 8), DEFAULT_COMPACT_CHUNK);

        assert!(store.set_block(5, 1, 5, 2));
        assert!(store.set_block(0, 3, 0, 7));
        assert!(!store.set_block(8, 0, 0, 1));
        assert!(!store.set_block(0, -1, 0, 1));
        assert_eq!(store.pending_edits(), 2);

        let (_, cells) = decode_level(&store);
        let dims = store.dims();
        assert_eq!(cells[dims.index(5, 1, 5).unwrap() as usize], 2);
        assert_eq!(cells[dims.index(0, 3, 0).unwrap() as usize], 7);
    }

    #[test]
    fn compaction_merges_and_preserves_late_edits() {
        let dir = tempfile::tempdir().unwrap();
        // A tiny window forces several compaction windows with trimmed
        // boundary runs.
        let store = open_store(&dir, Dimensions::new(8, 4, 8), 7);

        store.set_block(5, 1, 5, 2);
        store.set_block(7, 3, 7, 9);
        assert_eq!(store.compact().unwrap(), 2);
        assert_eq!(store.pending_edits(), 0);

        // The merged state must come from the file alone now.
        let (_, cells) = decode_level(&store);
        let dims = store.dims();
        assert_eq!(cells[dims.index(5, 1, 5).unwrap() as usize], 2);
        assert_eq!(cells[dims.index(7, 3, 7).unwrap() as usize], 9);
        assert_eq!(cells[dims.index(0, 0, 0).unwrap() as usize], GRASS);
        assert_eq!(cells[dims.index(0, 3, 0).unwrap() as usize], AIR);

        // An edit that lands after a compaction pass survives into the log.
        store.set_block(1, 0, 1, 4);
        assert_eq!(store.pending_edits(), 1);
        assert_eq!(store.compact().unwrap(), 1);
        assert_eq!(store.compact().unwrap(), 0);
    }

    #[test]
    fn compacted_file_reloads_with_state_intact() {
        let dir = tempfile::tempdir().unwrap();
        let dims = Dimensions::new(8, 4, 8);
        let index = {
            let store = open_store(&dir, dims, 7);
            store.set_block(3, 2, 3, 6);
            store.compact().unwrap();
            store.dims().index(3, 2, 3).unwrap()
        };

        let reopened = open_store(&dir, dims, DEFAULT_COMPACT_CHUNK);
        let (_, cells) = decode_level(&reopened);
        assert_eq!(cells[index as usize], 6);
    }

    #[test]
    fn mismatched_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        open_store(&dir, Dimensions::new(8, 4, 8), DEFAULT_COMPACT_CHUNK);
        assert!(matches!(
            WorldStore::open(
                dir.path().join("world.rle"),
                Dimensions::new(8, 4, 9),
                DEFAULT_COMPACT_CHUNK
            ),
            Err(WorldError::BadExpansion { .. })
        ));
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            WorldStore::open(
                dir.path().join("world.rle"),
                Dimensions::new(40_000, 1, 1),
                DEFAULT_COMPACT_CHUNK
            ),
            Err(WorldError::AxisTooLarge(_))
        ));
    }
}
