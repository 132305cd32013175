use crate::descriptor::WorkElement;
use crate::{AfuError, Hex};

/// Byte order in which the AFU's MMIO registers are presented to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
    Host,
}

/// Low-level access to one accelerator function instance.
///
/// Implemented by the libcxl bindings for real or PSLSE-simulated hardware
/// and by [`crate::loopback::LoopbackAfu`] in software. Opening is left to
/// each backend's constructor since it is backend-specific. Callers normally
/// go through [`Session`], which enforces the call order and tears the
/// backend down on every exit path.
pub trait Accelerator {
    /// Hands the descriptor at `wed_addr` to the accelerator and starts it.
    ///
    /// Returns as soon as the accelerator has accepted the descriptor; the
    /// job then runs asynchronously.
    ///
    /// # Safety
    ///
    /// * `wed_addr` must be the address of a valid, cache-line-aligned work
    ///   element descriptor whose source and destination fields point at
    ///   buffers of at least `size` cache lines.
    /// * The descriptor and both buffers must stay allocated until
    ///   [`Accelerator::close`] has returned. Until then the host must not
    ///   write to any of them, nor read the destination before observing a
    ///   non-zero status.
    unsafe fn attach(&mut self, wed_addr: u64) -> Result<(), AfuError>;

    /// Maps the problem-state MMIO space with the given register byte order.
    fn map_mmio(&mut self, endianness: Endianness) -> Result<(), AfuError>;

    /// Reads one 64-bit register at byte `offset` in the MMIO space.
    ///
    /// Has no effect on the accelerator's state.
    fn read_mmio64(&mut self, offset: u64) -> Result<u64, AfuError>;

    /// Unmaps the MMIO space. Does nothing if it is not mapped.
    fn unmap_mmio(&mut self);

    /// Detaches from the accelerator and releases the device.
    ///
    /// Must be idempotent and safe to call after any partial failure.
    fn close(&mut self);
}

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Device open, nothing attached.
    Open,
    /// A descriptor has been handed to the accelerator.
    Attached,
    /// Device released; no further operations are possible.
    Closed,
}

/// A logical connection to one accelerator instance running one job.
///
/// Attaching moves the [`WorkElement`] into the session, which keeps the
/// borrows of its buffers alive for as long as the accelerator may access
/// them: the host regains the destination buffer only by closing or
/// dropping the session, or through [`WorkElement::destination`] once the
/// status flag is raised.
///
/// ```compile_fail
/// use afu_core::buffer::AlignedBuffer;
/// use afu_core::descriptor::WorkElement;
/// use afu_core::loopback::LoopbackAfu;
/// use afu_core::session::Session;
///
/// let source = AlignedBuffer::cachelines(8).unwrap();
/// let mut destination = AlignedBuffer::cachelines(8).unwrap();
/// let wed = WorkElement::new(8, &source, &mut destination).unwrap();
/// let mut session = Session::new(LoopbackAfu::open("loopback").unwrap());
/// session.attach(wed).unwrap();
/// let in_flight = destination.as_slice();
/// session.close();
/// ```
///
/// Dropping the session unmaps the MMIO space and closes the device before
/// the descriptor is freed, so the accelerator is always detached before
/// the buffers are released. Leaking a session with [`std::mem::forget`]
/// while a job is in flight skips that detach and leaves the accelerator
/// with dangling addresses.
pub struct Session<'w, A: Accelerator> {
    afu: A,
    state: SessionState,
    mapped: bool,
    job: Option<WorkElement<'w>>,
}

impl<'w, A: Accelerator> Session<'w, A> {
    /// Wraps an opened accelerator backend.
    pub fn new(afu: A) -> Self {
        Self {
            afu,
            state: SessionState::Open,
            mapped: false,
            job: None,
        }
    }

    /// Hands `job` to the accelerator and starts execution.
    ///
    /// Does not wait for the job to finish. Fails if a descriptor is already
    /// attached, if the descriptor's status flag is not zero, or if the
    /// accelerator rejects the hand-off; the descriptor is dropped in each
    /// case, releasing its buffers.
    pub fn attach(&mut self, job: WorkElement<'w>) -> Result<(), AfuError> {
        self.expect_state(SessionState::Open, "attach")?;

        let status = job.status();
        if status != 0 {
            return Err(AfuError::StaleDescriptor {
                addr: job.addr(),
                status,
            });
        }

        // SAFETY: the session owns `job` from here on and closes the backend
        // before dropping it. The buffers it borrows outlive `'w`; the source
        // is borrowed shared and the destination exclusively, so the host
        // cannot write either of them meanwhile.
        unsafe { self.afu.attach(job.addr())? };

        tracing::info!(wed = %Hex(job.addr()), units = job.units(), "AFU attached");
        self.job = Some(job);
        self.state = SessionState::Attached;
        Ok(())
    }

    /// Maps the accelerator's control registers.
    ///
    /// Required before [`Session::read_register`]. Mapping an already mapped
    /// session is a no-op.
    pub fn map_control_registers(&mut self, endianness: Endianness) -> Result<(), AfuError> {
        if self.state == SessionState::Closed {
            return Err(AfuError::InvalidState {
                operation: "map MMIO",
                state: self.state,
            });
        }
        if self.mapped {
            return Ok(());
        }
        self.afu.map_mmio(endianness)?;
        self.mapped = true;
        tracing::debug!(?endianness, "MMIO space mapped");
        Ok(())
    }

    /// Reads a 64-bit control register.
    pub fn read_register(&mut self, offset: u64) -> Result<u64, AfuError> {
        if !self.mapped {
            return Err(AfuError::MmioNotMapped { offset });
        }
        self.afu.read_mmio64(offset)
    }

    /// Unmaps the control registers if they are mapped.
    pub fn unmap_control_registers(&mut self) {
        if self.mapped {
            self.afu.unmap_mmio();
            self.mapped = false;
            tracing::debug!("MMIO space unmapped");
        }
    }

    /// Unmaps the control registers and closes the device.
    ///
    /// Consumes the session, ending its borrow of the job's buffers.
    pub fn close(mut self) {
        self.teardown();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the control registers are currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// The descriptor handed to the accelerator, if any.
    pub fn job(&self) -> Option<&WorkElement<'w>> {
        self.job.as_ref()
    }

    /// The backend driving this session.
    pub fn accelerator(&self) -> &A {
        &self.afu
    }

    fn expect_state(&self, expected: SessionState, operation: &'static str) -> Result<(), AfuError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(AfuError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn teardown(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.unmap_control_registers();
        self.afu.close();
        self.state = SessionState::Closed;
        tracing::debug!("AFU session closed");
    }
}

impl<A: Accelerator> Drop for Session<'_, A> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    /// Records every backend call; optionally fails attach or map.
    #[derive(Default)]
    struct Recorder {
        calls: Rc<RefCell<Vec<&'static str>>>,
        fail_attach: bool,
        fail_map: bool,
    }

    impl Accelerator for Recorder {
        unsafe fn attach(&mut self, _wed_addr: u64) -> Result<(), AfuError> {
            self.calls.borrow_mut().push("attach");
            if self.fail_attach {
                return Err(AfuError::Attach {
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                });
            }
            Ok(())
        }

        fn map_mmio(&mut self, _endianness: Endianness) -> Result<(), AfuError> {
            self.calls.borrow_mut().push("map");
            if self.fail_map {
                return Err(AfuError::MmioMap {
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            Ok(())
        }

        fn read_mmio64(&mut self, _offset: u64) -> Result<u64, AfuError> {
            self.calls.borrow_mut().push("read");
            Ok(7)
        }

        fn unmap_mmio(&mut self) {
            self.calls.borrow_mut().push("unmap");
        }

        fn close(&mut self) {
            self.calls.borrow_mut().push("close");
        }
    }

    fn buffers() -> (AlignedBuffer, AlignedBuffer) {
        (
            AlignedBuffer::cachelines(1).unwrap(),
            AlignedBuffer::cachelines(1).unwrap(),
        )
    }

    #[test]
    fn full_lifecycle_tears_down_once() {
        let (src, mut dst) = buffers();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut session = Session::new(Recorder {
            calls: calls.clone(),
            ..Default::default()
        });

        session.attach(wed).unwrap();
        assert_eq!(session.state(), SessionState::Attached);
        session.map_control_registers(Endianness::Big).unwrap();
        assert_eq!(session.read_register(0x3ff_fff8).unwrap(), 7);
        session.close();

        assert_eq!(*calls.borrow(), ["attach", "map", "read", "unmap", "close"]);
    }

    #[test]
    fn read_before_map_is_rejected() {
        let mut session = Session::new(Recorder::default());
        assert!(matches!(
            session.read_register(0x10),
            Err(AfuError::MmioNotMapped { offset: 0x10 })
        ));
    }

    #[test]
    fn failed_attach_still_closes_on_drop() {
        let (src, mut dst) = buffers();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        {
            let mut session = Session::new(Recorder {
                calls: calls.clone(),
                fail_attach: true,
                ..Default::default()
            });
            assert!(matches!(session.attach(wed), Err(AfuError::Attach { .. })));
            assert_eq!(session.state(), SessionState::Open);
        }
        assert_eq!(*calls.borrow(), ["attach", "close"]);
    }

    #[test]
    fn failed_map_skips_unmap() {
        let (src, mut dst) = buffers();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        {
            let mut session = Session::new(Recorder {
                calls: calls.clone(),
                fail_map: true,
                ..Default::default()
            });
            session.attach(wed).unwrap();
            assert!(matches!(
                session.map_control_registers(Endianness::Big),
                Err(AfuError::MmioMap { .. })
            ));
            assert!(!session.is_mapped());
        }
        assert_eq!(*calls.borrow(), ["attach", "map", "close"]);
    }

    #[test]
    fn second_attach_is_rejected() {
        let (src, mut dst) = buffers();
        let mut other = AlignedBuffer::cachelines(1).unwrap();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        let again = WorkElement::new(1, &src, &mut other).unwrap();
        let mut session = Session::new(Recorder::default());
        session.attach(wed).unwrap();
        assert!(matches!(
            session.attach(again),
            Err(AfuError::InvalidState {
                operation: "attach",
                state: SessionState::Attached
            })
        ));
    }

    #[test]
    fn completed_descriptor_cannot_be_reattached() {
        let (src, mut dst) = buffers();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        wed.descriptor()
            .status
            .store(1, std::sync::atomic::Ordering::Release);
        let mut session = Session::new(Recorder::default());
        assert!(matches!(
            session.attach(wed),
            Err(AfuError::StaleDescriptor { status: 1, .. })
        ));
    }

    #[test]
    fn closing_hands_the_destination_back() {
        let (src, mut dst) = buffers();
        let wed = WorkElement::new(1, &src, &mut dst).unwrap();
        let mut session = Session::new(Recorder::default());
        session.attach(wed).unwrap();
        assert!(session.job().unwrap().destination().is_none());
        session.close();

        dst.as_mut_slice()[0] = 1;
        assert_eq!(dst.as_slice()[0], 1);
    }
}
