mod job;

use afu_core::poller::{DEFAULT_REPORT_EVERY, PollConfig};
use afu_core::verify::Verdict;
use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit status for a completed job whose destination does not match.
///
/// Distinct from clap's usage-error status 2.
const EXIT_MISMATCH: u8 = 3;

/// Copies cache lines through the memcopy AFU and checks the result.
#[derive(Debug, Parser)]
#[command(name = "afu-memcopy", version)]
struct Cli {
    /// Number of 128-byte cache lines to copy.
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    units: u32,

    /// AFU device to open instead of the build's default.
    #[arg(long, default_value = afu_common::mmio::DEFAULT_DEVICE)]
    device: PathBuf,

    /// Give up after this many completion polls.
    #[arg(long)]
    max_polls: Option<u64>,

    /// Give up after this many milliseconds of polling.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Log progress every this many polls (0 disables).
    #[arg(long, default_value_t = DEFAULT_REPORT_EVERY)]
    report_every: u64,

    /// Exit with status 3 when the copy does not verify.
    #[arg(long)]
    strict: bool,

    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Make the software AFU leave the last cache line uncopied.
    #[cfg(not(feature = "hardware"))]
    #[arg(long)]
    inject_fault: bool,

    /// Total time the software AFU takes for the job, in milliseconds.
    #[cfg(not(feature = "hardware"))]
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,
}

impl Cli {
    fn poll_config(&self) -> PollConfig {
        let mut config = PollConfig::default().with_report_every(self.report_every);
        if let Some(max) = self.max_polls {
            config = config.with_max_polls(max);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_timeout(Duration::from_millis(ms));
        }
        config
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "hardware")]
fn open_accelerator(cli: &Cli) -> Result<afu_cxl::CxlAfu> {
    afu_cxl::CxlAfu::open(&cli.device).context("opening AFU device")
}

#[cfg(not(feature = "hardware"))]
fn open_accelerator(cli: &Cli) -> Result<afu_core::loopback::LoopbackAfu> {
    use afu_core::loopback::{LoopbackAfu, LoopbackFault};

    let fault = if cli.inject_fault {
        LoopbackFault::TruncateLastLine
    } else {
        LoopbackFault::None
    };
    let line_latency = Duration::from_millis(cli.latency_ms) / cli.units;
    let afu = LoopbackAfu::open(&cli.device)
        .context("opening AFU device")?
        .with_fault(fault)
        .with_line_latency(line_latency);
    Ok(afu)
}

/// Maps a verification outcome to the process exit status.
///
/// A completed job exits 0 whatever the verdict, unless `strict` asks for
/// a mismatch to be reported as [`EXIT_MISMATCH`].
fn exit_status(verdict: &Verdict, strict: bool) -> u8 {
    match verdict {
        Verdict::Mismatch(_) if strict => EXIT_MISMATCH,
        _ => 0,
    }
}

/// Opens the AFU, runs one job and prints its summary.
fn run(cli: &Cli) -> Result<u8> {
    let afu = open_accelerator(cli)?;
    let summary = job::run_job(afu, cli.units, cli.poll_config())?;

    println!(
        "Polls: {}  last response counter: {}  elapsed: {:?}",
        summary.report.polls, summary.report.last_counter, summary.report.elapsed
    );
    match &summary.verdict {
        Verdict::Match => println!("Verify: {} cache lines match.", cli.units),
        Verdict::Mismatch(mismatch) => {
            println!("Verify: MISMATCH");
            print!("{mismatch}");
        }
    }
    Ok(exit_status(&summary.verdict, cli.strict))
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(&cli).map(ExitCode::from)
}
