use crate::AfuError;
use afu_common::mmio::{CACHELINE_BYTES, CACHELINE_WORDS};
use std::fmt;

/// Most rows rendered in a mismatch dump. Further mismatched rows are only
/// counted.
pub const MAX_DUMP_ROWS: usize = 16;

/// One cache line of both buffers, as 64-bit words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDump {
    /// Row index, i.e. byte offset divided by the line size.
    pub row: usize,
    pub expected: [u64; CACHELINE_WORDS],
    pub actual: [u64; CACHELINE_WORDS],
}

impl RowDump {
    fn capture(row: usize, expected: &[u8], actual: &[u8]) -> Self {
        Self {
            row,
            expected: words(expected),
            actual: words(actual),
        }
    }

    /// Byte offset of the row's first byte.
    pub fn offset(&self) -> usize {
        self.row * CACHELINE_BYTES
    }
}

/// Details of a failed comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// Offset of the first byte that differs.
    pub first_offset: usize,
    /// Number of differing bytes.
    pub differing_bytes: usize,
    /// Number of lines containing at least one differing byte.
    pub differing_rows: usize,
    /// Up to [`MAX_DUMP_ROWS`] mismatched lines in address order. The first
    /// entry is the line holding `first_offset`.
    pub rows: Vec<RowDump>,
}

/// Outcome of a verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch(Mismatch),
}

impl Verdict {
    /// Whether the buffers were byte-identical.
    pub fn is_match(&self) -> bool {
        matches!(self, Verdict::Match)
    }
}

/// Compares the first `byte_len` bytes of `expected` and `actual`.
///
/// The comparison is exact; there is no tolerance. On mismatch the differing
/// regions are captured as 128-byte rows of sixteen words each.
///
/// # Returns
///
/// The verdict, or [`AfuError::BufferTooSmall`] if either slice is shorter
/// than `byte_len`.
pub fn verify(expected: &[u8], actual: &[u8], byte_len: usize) -> Result<Verdict, AfuError> {
    for buf in [expected, actual] {
        if buf.len() < byte_len {
            return Err(AfuError::BufferTooSmall {
                required: byte_len,
                actual: buf.len(),
            });
        }
    }
    let expected = &expected[..byte_len];
    let actual = &actual[..byte_len];

    if expected == actual {
        tracing::info!(bytes = byte_len, "verification passed");
        return Ok(Verdict::Match);
    }

    let mut first_offset = None;
    let mut differing_bytes = 0;
    let mut differing_rows = 0;
    let mut rows = Vec::new();

    for (row, (exp, act)) in expected
        .chunks(CACHELINE_BYTES)
        .zip(actual.chunks(CACHELINE_BYTES))
        .enumerate()
    {
        if exp == act {
            continue;
        }
        let diffs = exp.iter().zip(act).filter(|(a, b)| a != b).count();
        if first_offset.is_none() {
            let col = exp.iter().zip(act).position(|(a, b)| a != b).unwrap_or(0);
            first_offset = Some(row * CACHELINE_BYTES + col);
        }
        differing_bytes += diffs;
        differing_rows += 1;
        if rows.len() < MAX_DUMP_ROWS {
            rows.push(RowDump::capture(row, exp, act));
        }
    }

    let mismatch = Mismatch {
        first_offset: first_offset.unwrap_or(0),
        differing_bytes,
        differing_rows,
        rows,
    };
    tracing::warn!(
        first_offset = mismatch.first_offset,
        differing_bytes,
        differing_rows,
        "verification failed"
    );
    Ok(Verdict::Mismatch(mismatch))
}

/// Packs up to one line of bytes into words, zero-padding a short tail.
fn words(line: &[u8]) -> [u64; CACHELINE_WORDS] {
    let mut padded = [0u8; CACHELINE_BYTES];
    padded[..line.len()].copy_from_slice(line);
    let mut out = [0u64; CACHELINE_WORDS];
    for (word, bytes) in out.iter_mut().zip(padded.chunks_exact(8)) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        *word = u64::from_ne_bytes(raw);
    }
    out
}

impl fmt::Display for RowDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, words) in [("expected", &self.expected), ("actual  ", &self.actual)] {
            write!(f, "row {:4} @ {:#08x} {}:", self.row, self.offset(), label)?;
            for w in words {
                write!(f, " {:016x}", w)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} bytes differ in {} rows, first at offset {:#x} (row {})",
            self.differing_bytes,
            self.differing_rows,
            self.first_offset,
            self.first_offset / CACHELINE_BYTES
        )?;
        for row in &self.rows {
            write!(f, "{}", row)?;
        }
        if self.differing_rows > self.rows.len() {
            writeln!(f, "... {} more rows", self.differing_rows - self.rows.len())?;
        }
        Ok(())
    }
}
