use crate::AfuError;
use crate::session::{Accelerator, Endianness};
use afu_common::mmio::{CACHELINE_BYTES, RESPONSE_COUNTER};
use afu_common::wed::WorkElementDescriptor;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Size of the AFU's problem-state MMIO space.
const MMIO_SPACE_BYTES: u64 = 0x400_0000;

/// PSL responses per copied line: one for the read, one for the write.
const RESPONSES_PER_LINE: u64 = 2;

/// Misbehaviour injected into the software AFU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackFault {
    /// Copy every line, then raise the status flag.
    #[default]
    None,
    /// Copy all but the last line, leaving it untouched, then raise the flag.
    TruncateLastLine,
    /// Copy every line but never raise the flag.
    Hang,
}

/// State shared between the host-facing handle and the worker thread.
struct Shared {
    response_counter: AtomicU64,
    detached: AtomicBool,
}

/// In-process model of the memcopy AFU.
///
/// On attach a worker thread reads the descriptor by address, copies `size`
/// cache lines from `source` to `destination`, bumps the response counter
/// for every PSL response a line would cause, and finally release-stores
/// `status = 1`. The host sees exactly what it would see from hardware: an
/// address hand-off, a counter register, and a flag flipping asynchronously.
pub struct LoopbackAfu {
    device: PathBuf,
    fault: LoopbackFault,
    line_latency: Duration,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    mapped: Option<Endianness>,
    closed: bool,
}

impl LoopbackAfu {
    /// Opens a software AFU standing in for `device`.
    pub fn open(device: impl AsRef<Path>) -> Result<Self, AfuError> {
        let device = device.as_ref().to_path_buf();
        tracing::info!(device = %device.display(), "opened loopback AFU");
        Ok(Self {
            device,
            fault: LoopbackFault::None,
            line_latency: Duration::ZERO,
            shared: Arc::new(Shared {
                response_counter: AtomicU64::new(0),
                detached: AtomicBool::new(false),
            }),
            worker: None,
            mapped: None,
            closed: false,
        })
    }

    /// Injects `fault` into every job this AFU runs.
    pub fn with_fault(mut self, fault: LoopbackFault) -> Self {
        self.fault = fault;
        self
    }

    /// Delay the worker spends on every line, to stretch the job.
    pub fn with_line_latency(mut self, latency: Duration) -> Self {
        self.line_latency = latency;
        self
    }

    /// Device path this AFU stands in for.
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// PSL responses counted so far, two per copied line.
    pub fn response_counter(&self) -> u64 {
        self.shared.response_counter.load(Ordering::Relaxed)
    }

    /// Byte order of the current MMIO mapping, if mapped.
    pub fn mapped_endianness(&self) -> Option<Endianness> {
        self.mapped
    }
}

impl Accelerator for LoopbackAfu {
    unsafe fn attach(&mut self, wed_addr: u64) -> Result<(), AfuError> {
        if self.closed || self.worker.is_some() {
            return Err(AfuError::Attach {
                source: io::Error::other("AFU context already attached or closed"),
            });
        }
        if wed_addr == 0 || wed_addr % CACHELINE_BYTES as u64 != 0 {
            return Err(AfuError::Attach {
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("descriptor address {wed_addr:#x} is not cache-line aligned"),
                ),
            });
        }

        let shared = self.shared.clone();
        let fault = self.fault;
        let latency = self.line_latency;
        let worker = thread::Builder::new()
            .name("loopback-afu".into())
            // SAFETY: the attach contract keeps the descriptor and its buffers
            // valid until close joins this thread, and the host does not touch the
            // destination before the status flag is raised.
            .spawn(move || unsafe { run_job(wed_addr, &shared, fault, latency) })
            .map_err(|source| AfuError::Attach { source })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn map_mmio(&mut self, endianness: Endianness) -> Result<(), AfuError> {
        if self.closed {
            return Err(AfuError::MmioMap {
                source: io::Error::from(io::ErrorKind::NotConnected),
            });
        }
        self.mapped = Some(endianness);
        Ok(())
    }

    fn read_mmio64(&mut self, offset: u64) -> Result<u64, AfuError> {
        if self.mapped.is_none() {
            return Err(AfuError::MmioNotMapped { offset });
        }
        if offset % 8 != 0 || offset >= MMIO_SPACE_BYTES {
            return Err(AfuError::MmioRead {
                offset,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            });
        }
        Ok(match offset {
            RESPONSE_COUNTER => self.shared.response_counter.load(Ordering::Relaxed),
            _ => 0,
        })
    }

    fn unmap_mmio(&mut self) {
        self.mapped = None;
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.mapped = None;
        self.shared.detached.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("loopback AFU worker panicked");
            }
        }
        tracing::debug!(device = %self.device.display(), "loopback AFU detached");
    }
}

impl Drop for LoopbackAfu {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker body: executes one descriptor the way the AFU does.
///
/// # Safety
///
/// `wed_addr` must point at a valid descriptor whose buffers hold at least
/// `size` lines, all of which stay allocated until `shared.detached` is set
/// and this function has returned.
unsafe fn run_job(wed_addr: u64, shared: &Shared, fault: LoopbackFault, latency: Duration) {
    let wed = ptr::with_exposed_provenance::<WorkElementDescriptor>(wed_addr as usize);
    // SAFETY: guaranteed by the caller; only the atomic status is written.
    let wed = unsafe { &*wed };
    let lines = wed.size as usize;
    let source = ptr::with_exposed_provenance::<u8>(wed.source as usize);
    let destination = ptr::with_exposed_provenance_mut::<u8>(wed.destination as usize);

    let copied = match fault {
        LoopbackFault::TruncateLastLine => lines.saturating_sub(1),
        LoopbackFault::None | LoopbackFault::Hang => lines,
    };

    for line in 0..copied {
        if shared.detached.load(Ordering::Acquire) {
            return;
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let at = line * CACHELINE_BYTES;
        // SAFETY: both buffers hold `lines` lines and do not overlap.
        unsafe { ptr::copy_nonoverlapping(source.add(at), destination.add(at), CACHELINE_BYTES) };
        shared
            .response_counter
            .fetch_add(RESPONSES_PER_LINE, Ordering::Relaxed);
    }

    if fault == LoopbackFault::Hang {
        while !shared.detached.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(1));
        }
        return;
    }

    wed.status.store(1, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use crate::descriptor::WorkElement;
    use crate::session::Session;
    use std::time::Instant;

    fn wait_for(wed: &WorkElement<'_>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !wed.is_complete() {
            assert!(Instant::now() < deadline, "loopback AFU never completed");
            thread::yield_now();
        }
    }

    #[test]
    fn copies_and_raises_flag() {
        let mut src = AlignedBuffer::cachelines(3).unwrap();
        src.as_mut_slice().fill(0x5a);
        let mut dst = AlignedBuffer::cachelines(3).unwrap();
        let wed = WorkElement::new(3, &src, &mut dst).unwrap();

        let mut session = Session::new(LoopbackAfu::open("/dev/cxl/afu0.0d").unwrap());
        session.attach(wed).unwrap();
        let job = session.job().unwrap();
        wait_for(job);
        assert_eq!(job.status(), 1);
        assert_eq!(job.destination().unwrap().as_slice(), src.as_slice());
        assert_eq!(session.accelerator().response_counter(), 6);
    }

    #[test]
    fn truncated_job_leaves_last_line_zero() {
        let mut src = AlignedBuffer::cachelines(2).unwrap();
        src.as_mut_slice().fill(0xff);
        let mut dst = AlignedBuffer::cachelines(2).unwrap();
        let wed = WorkElement::new(2, &src, &mut dst).unwrap();

        let afu = LoopbackAfu::open("loopback")
            .unwrap()
            .with_fault(LoopbackFault::TruncateLastLine);
        let mut session = Session::new(afu);
        session.attach(wed).unwrap();
        wait_for(session.job().unwrap());
        session.close();

        assert!(dst.as_slice()[..CACHELINE_BYTES].iter().all(|&b| b == 0xff));
        assert!(dst.as_slice()[CACHELINE_BYTES..].iter().all(|&b| b == 0));
    }

    #[test]
    fn hung_job_is_released_by_close() {
        let src = AlignedBuffer::cachelines(1).unwrap();
        let mut dst = AlignedBuffer::cachelines(1).unwrap();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();

        let afu = LoopbackAfu::open("loopback").unwrap().with_fault(LoopbackFault::Hang);
        let mut session = Session::new(afu);
        session.attach(wed).unwrap();
        thread::sleep(Duration::from_millis(5));
        let job = session.job().unwrap();
        assert_eq!(job.status(), 0);
        assert!(job.destination().is_none());
        session.close();
    }

    #[test]
    fn registers_need_mapping_and_alignment() {
        let mut afu = LoopbackAfu::open("loopback").unwrap();
        assert!(matches!(
            afu.read_mmio64(RESPONSE_COUNTER),
            Err(AfuError::MmioNotMapped { .. })
        ));
        afu.map_mmio(Endianness::Big).unwrap();
        assert_eq!(afu.mapped_endianness(), Some(Endianness::Big));
        assert_eq!(afu.read_mmio64(RESPONSE_COUNTER).unwrap(), 0);
        assert!(matches!(afu.read_mmio64(0x3), Err(AfuError::MmioRead { .. })));
        assert!(matches!(
            afu.read_mmio64(MMIO_SPACE_BYTES),
            Err(AfuError::MmioRead { .. })
        ));
    }

    #[test]
    fn misaligned_descriptor_address_is_rejected() {
        let mut afu = LoopbackAfu::open("loopback").unwrap();
        // SAFETY: rejected before any access.
        let err = unsafe { afu.attach(0x1008) }.unwrap_err();
        assert!(matches!(err, AfuError::Attach { .. }));
    }

    #[test]
    fn closed_afu_refuses_work() {
        let mut afu = LoopbackAfu::open("loopback").unwrap();
        afu.close();
        afu.close();
        assert!(afu.map_mmio(Endianness::Big).is_err());
    }
}
