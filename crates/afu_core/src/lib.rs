//! Host side of the memcopy AFU handshake.
//!
//! This crate builds the cache-line-aligned buffers and work element
//! descriptor handed to the accelerator, drives the attach and MMIO map
//! sequence through a pluggable [`session::Accelerator`] backend, busy-polls
//! the descriptor's status flag until the AFU reports completion, and
//! verifies the copied data.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Cache-line aligned host allocations shared with the accelerator.
///
/// Every buffer the AFU touches, the descriptor included, is allocated here
/// with the interconnect's line size as alignment. Buffers are zeroed on
/// allocation and released when dropped.
pub mod buffer;

/// Work element descriptor construction.
///
/// Populates the fixed-layout descriptor from a unit count and the source and
/// destination buffers, and exposes the completion flag to the poller.
pub mod descriptor;

/// Software model of the memcopy AFU.
///
/// Consumes a descriptor by address on a background thread the way the
/// hardware does. Used by the test suite and by host builds without libcxl.
pub mod loopback;

/// Completion poller for attached jobs.
///
/// Busy-waits on the descriptor's status flag, reading the response counter
/// register once per iteration as a liveness signal.
pub mod poller;

/// Accelerator backend trait and the session state machine built on it.
pub mod session;

/// Byte-exact verification of the copied data.
pub mod verify;

/// Errors raised while setting up, running or tearing down an AFU job.
///
/// Each variant names the operation that failed. Setup failures
/// (allocation, open, attach, map) are fatal to a run and never retried;
/// a verification mismatch is not an error and is reported through
/// [`verify::Verdict`] instead.
#[derive(Debug, Error)]
pub enum AfuError {
    /// The aligned allocator could not satisfy the request.
    ///
    /// Raised for zero-sized requests, alignments that are not a power of
    /// two, sizes that overflow when rounded to the alignment, and
    /// out-of-memory conditions.
    #[error("aligned allocation of {size} bytes at alignment {align} failed")]
    Allocation { size: usize, align: usize },

    /// The accelerator device could not be opened.
    #[error("cannot open AFU device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The accelerator rejected the descriptor hand-off.
    #[error("AFU attach failed: {source}")]
    Attach {
        #[source]
        source: io::Error,
    },

    /// The problem-state MMIO region could not be mapped.
    #[error("MMIO map failed: {source}")]
    MmioMap {
        #[source]
        source: io::Error,
    },

    /// A register read was issued before the MMIO region was mapped.
    #[error("MMIO read at offset {offset:#x} issued before the MMIO space was mapped")]
    MmioNotMapped { offset: u64 },

    /// A mapped register read failed.
    #[error("MMIO read at offset {offset:#x} failed: {source}")]
    MmioRead {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// The AFU did not raise its status flag within the configured bound.
    #[error("AFU did not complete after {polls} polls ({elapsed:?})")]
    CompletionTimeout { polls: u64, elapsed: Duration },

    /// A buffer is too small for the number of lines in the job.
    #[error("buffer of {actual} bytes cannot hold the {required} bytes of the job")]
    BufferTooSmall { required: usize, actual: usize },

    /// A buffer handed to the AFU does not start on a cache-line boundary.
    #[error("buffer at {addr:#x} is not aligned to {align} bytes")]
    Misaligned { addr: u64, align: usize },

    /// The descriptor's status flag was already raised at attach time.
    #[error("descriptor at {addr:#x} has status {status:#x}, expected 0 at hand-off")]
    StaleDescriptor { addr: u64, status: u8 },

    /// The session is not in a state that allows the requested operation.
    #[error("cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: session::SessionState,
    },
}

/// Formats an address as `0x...` when a log event is actually recorded.
pub(crate) struct Hex(pub u64);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
