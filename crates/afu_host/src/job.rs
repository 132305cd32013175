use afu_core::buffer::AlignedBuffer;
use afu_core::descriptor::WorkElement;
use afu_core::poller::{CompletionPoller, PollConfig, PollReport};
use afu_core::session::{Accelerator, Endianness, Session};
use afu_core::verify::{Verdict, verify};
use anyhow::{Context, Result};

/// Outcome of one memcopy job.
#[derive(Debug)]
pub struct JobSummary {
    pub report: PollReport,
    pub verdict: Verdict,
}

/// Fills `buf` with ascending 64-bit words, `buf[i] = i`.
pub fn fill_ascending(buf: &mut AlignedBuffer) {
    for (i, word) in buf.words_mut().iter_mut().enumerate() {
        *word = i as u64;
    }
}

/// Runs one copy of `units` cache lines on `afu` and verifies the result.
///
/// Allocates and fills the source, allocates a zeroed destination, hands the
/// descriptor to the accelerator, maps its registers big-endian and polls
/// until the status flag is raised. The session is closed before the
/// destination is compared, so the accelerator is detached on every path,
/// including early returns on setup failures.
pub fn run_job<A: Accelerator>(afu: A, units: u32, poll: PollConfig) -> Result<JobSummary> {
    let lines = units as usize;

    let mut source = AlignedBuffer::cachelines(lines).context("allocating source buffer")?;
    fill_ascending(&mut source);
    let mut destination =
        AlignedBuffer::cachelines(lines).context("allocating destination buffer")?;
    let wed = WorkElement::new(units, &source, &mut destination)
        .context("building work element descriptor")?;
    let byte_len = wed.byte_len();

    let mut session = Session::new(afu);
    session.attach(wed).context("attaching AFU")?;
    println!("AFU has started.");

    session
        .map_control_registers(Endianness::Big)
        .context("mapping AFU MMIO space")?;

    let mut poller = CompletionPoller::new(poll);
    let report = poller
        .wait(&mut session)
        .context("waiting for AFU completion")?;
    println!("AFU is done.");
    session.close();

    let verdict = verify(source.as_slice(), destination.as_slice(), byte_len)
        .context("verifying destination buffer")?;
    Ok(JobSummary { report, verdict })
}
