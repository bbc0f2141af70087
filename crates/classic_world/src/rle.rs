//! Reading and writing the run-length encoded world format.

use std::io::{self, ErrorKind, Read, Write};

use crate::WorldError;

/// Largest cell count one on-disk pair can carry.
pub const MAX_RUN: u64 = 255;

/// Lazily yields `(count, block)` pairs from an RLE byte stream.
pub struct RunReader<R> {
    src: R,
}

impl<R: Read> RunReader<R> {
    pub fn new(src: R) -> Self {
        Self { src }
    }

    /// Reads the next pair. Returns `Ok(None)` at a clean end of stream and
    /// an error when the stream ends between the two bytes of a pair or a
    /// pair carries a zero count.
    pub fn next_run(&mut self) -> Result<Option<(u8, u8)>, WorldError> {
        let mut count = [0_u8; 1];
        loop {
            match self.src.read(&mut count) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let mut block = [0_u8; 1];
        self.src.read_exact(&mut block).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                WorldError::TruncatedRun
            } else {
                e.into()
            }
        })?;

        if count[0] == 0 {
            return Err(WorldError::ZeroRun);
        }

        Ok(Some((count[0], block[0])))
    }
}

/// Writes `(count, block)` pairs, splitting counts above 255 into as many
/// full pairs as needed plus a remainder.
pub struct RunWriter<W> {
    out: W,
}

impl<W: Write> RunWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_run(&mut self, mut count: u64, block: u8) -> io::Result<()> {
        while count > MAX_RUN {
            self.out.write_all(&[MAX_RUN as u8, block])?;
            count -= MAX_RUN;
        }
        if count > 0 {
            self.out.write_all(&[count as u8, block])?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Streaming encoder that coalesces adjacent equal cells into runs before
/// handing them to a [`RunWriter`].
pub struct RleEncoder<W: Write> {
    out: RunWriter<W>,
    pending: Option<(u64, u8)>,
}

impl<W: Write> RleEncoder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: RunWriter::new(out),
            pending: None,
        }
    }

    pub fn push_run(&mut self, count: u64, block: u8) -> io::Result<()> {
        if count == 0 {
            return Ok(());
        }
        match &mut self.pending {
            Some((pending_count, pending_block)) if *pending_block == block => {
                *pending_count += count;
            }
            Some((pending_count, pending_block)) => {
                let (flushed_count, flushed_block) = (*pending_count, *pending_block);
                self.out.write_run(flushed_count, flushed_block)?;
                self.pending = Some((count, block));
            }
            None => self.pending = Some((count, block)),
        }
        Ok(())
    }

    pub fn push_slice(&mut self, cells: &[u8]) -> io::Result<()> {
        let mut i = 0;
        while i < cells.len() {
            let block = cells[i];
            let mut j = i + 1;
            while j < cells.len() && cells[j] == block {
                j += 1;
            }
            self.push_run((j - i) as u64, block)?;
            i = j;
        }
        Ok(())
    }

    /// Flushes the held-back run and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some((count, block)) = self.pending.take() {
            self.out.write_run(count, block)?;
        }
        Ok(self.out.into_inner())
    }
}

/// End-exclusive expansion index after each run. The compactor binary-searches
/// this table for the runs overlapping a window.
pub fn cumulative_ends(counts: &[u8]) -> Vec<u64> {
    let mut total = 0_u64;
    counts
        .iter()
        .map(|&count| {
            total += u64::from(count);
            total
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::{thread_rng, Rng};

    use super::*;

    fn expand(encoded: &[u8]) -> Vec<u8> {
        let mut runs = RunReader::new(encoded);
        let mut cells = vec![];
        while let Some((count, block)) = runs.next_run().unwrap() {
            cells.extend(std::iter::repeat(block).take(usize::from(count)));
        }
        cells
    }

    #[test]
    fn random_cells_roundtrip() {
        let mut rng = thread_rng();
        for _ in 0..20 {
            let cells: Vec<u8> = (0..rng.gen_range(0..2000))
                .map(|_| rng.gen_range(0..4))
                .collect();

            let mut enc = RleEncoder::new(vec![]);
            enc.push_slice(&cells).unwrap();
            let encoded = enc.finish().unwrap();

            assert_eq!(encoded.len() % 2, 0);
            assert!(encoded.iter().step_by(2).all(|&count| count != 0));
            assert_eq!(expand(&encoded), cells);
        }
    }

    #[test]
    fn long_runs_are_split_at_255() {
        let mut out = RunWriter::new(vec![]);
        out.write_run(600, 7).unwrap();
        assert_eq!(out.into_inner(), [255, 7, 255, 7, 90, 7]);
    }

    #[test]
    fn encoder_coalesces_across_pushes() {
        let mut enc = RleEncoder::new(vec![]);
        enc.push_run(100, 1).unwrap();
        enc.push_run(100, 1).unwrap();
        enc.push_slice(&[1, 1, 2]).unwrap();
        assert_eq!(enc.finish().unwrap(), [202, 1, 1, 2]);
    }

    #[test]
    fn truncated_and_zero_runs_are_errors() {
        assert!(matches!(
            RunReader::new(&[3_u8][..]).next_run(),
            Err(WorldError::TruncatedRun)
        ));
        assert!(matches!(
            RunReader::new(&[0_u8, 5][..]).next_run(),
            Err(WorldError::ZeroRun)
        ));
        assert!(RunReader::new(&[][..]).next_run().unwrap().is_none());
    }

    #[test]
    fn cumulative_ends_are_end_exclusive() {
        assert_eq!(cumulative_ends(&[3, 5, 1]), [3, 8, 9]);
        assert!(cumulative_ends(&[]).is_empty());
    }
}
