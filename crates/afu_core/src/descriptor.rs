use crate::buffer::AlignedBuffer;
use crate::{AfuError, Hex};
use afu_common::mmio::CACHELINE_BYTES;
use afu_common::wed::WorkElementDescriptor;
use std::mem::size_of;
use std::sync::atomic::Ordering;

/// A populated work element descriptor and the buffers it points at.
///
/// The descriptor lives in its own cache-line-aligned allocation and is
/// written exactly once, here, before the accelerator sees it. Afterwards
/// the host can only observe the status flag. The source buffer is borrowed
/// shared, since the accelerator only reads it. The destination is borrowed
/// exclusively for the descriptor's whole lifetime and is handed back only
/// once the status flag has been raised, so the host cannot read memory the
/// accelerator is still writing:
///
/// ```compile_fail
/// use afu_core::buffer::AlignedBuffer;
/// use afu_core::descriptor::WorkElement;
///
/// let source = AlignedBuffer::cachelines(1).unwrap();
/// let mut destination = AlignedBuffer::cachelines(1).unwrap();
/// let wed = WorkElement::new(1, &source, &mut destination).unwrap();
/// let early = destination.as_slice();
/// drop(wed);
/// ```
pub struct WorkElement<'b> {
    block: AlignedBuffer,
    source: &'b AlignedBuffer,
    destination: &'b mut AlignedBuffer,
}

impl<'b> WorkElement<'b> {
    /// Builds the descriptor for copying `units` cache lines.
    ///
    /// Sets `status` to zero and fills `size`, `source` and `destination`;
    /// every other field stays zero. A zero unit count is passed through
    /// unchanged since its meaning is up to the accelerator.
    ///
    /// # Arguments
    ///
    /// * `units` - Number of cache lines to copy
    /// * `source` - Buffer the accelerator reads from
    /// * `destination` - Buffer the accelerator writes to
    ///
    /// # Returns
    ///
    /// The descriptor, or an error if either buffer is misaligned or shorter
    /// than `units` lines, or if the descriptor block cannot be allocated.
    pub fn new(
        units: u32,
        source: &'b AlignedBuffer,
        destination: &'b mut AlignedBuffer,
    ) -> Result<Self, AfuError> {
        let required = units as usize * CACHELINE_BYTES;
        for buf in [source, &*destination] {
            if buf.addr() % CACHELINE_BYTES as u64 != 0 {
                return Err(AfuError::Misaligned {
                    addr: buf.addr(),
                    align: CACHELINE_BYTES,
                });
            }
            if buf.len() < required {
                return Err(AfuError::BufferTooSmall {
                    required,
                    actual: buf.len(),
                });
            }
        }
        if units == 0 {
            tracing::warn!("descriptor for zero cache lines, behaviour is up to the AFU");
        }

        let mut block = AlignedBuffer::allocate(size_of::<WorkElementDescriptor>(), CACHELINE_BYTES)?;

        // SAFETY: block is zeroed, sized and aligned for the descriptor, and
        // all-zero is a valid descriptor. Nothing else references it yet.
        let wed = unsafe { &mut *block.as_mut_ptr().cast::<WorkElementDescriptor>() };
        *wed.status.get_mut() = 0;
        wed.size = units;
        wed.source = source.addr();
        wed.destination = destination.addr();

        tracing::debug!(
            wed = %Hex(block.addr()),
            units,
            source = %Hex(wed.source),
            destination = %Hex(wed.destination),
            "work element descriptor ready"
        );

        Ok(Self {
            block,
            source,
            destination,
        })
    }

    /// The descriptor as the accelerator sees it.
    pub fn descriptor(&self) -> &WorkElementDescriptor {
        // SAFETY: block holds an initialised descriptor; the only field the
        // accelerator writes afterwards is the atomic status byte.
        unsafe { &*self.block.as_ptr().cast::<WorkElementDescriptor>() }
    }

    /// Address handed to the accelerator at attach time.
    pub fn addr(&self) -> u64 {
        self.block.addr()
    }

    /// Number of cache lines the job copies.
    pub fn units(&self) -> u32 {
        self.descriptor().size
    }

    /// Number of bytes the job copies.
    pub fn byte_len(&self) -> usize {
        self.units() as usize * CACHELINE_BYTES
    }

    /// Current value of the status flag, read with acquire ordering.
    ///
    /// Every call is a fresh load, so a value written by the accelerator
    /// becomes visible to the next call, together with the data it wrote
    /// before raising the flag.
    pub fn status(&self) -> u8 {
        self.descriptor().status.load(Ordering::Acquire)
    }

    /// Whether the accelerator has raised the status flag.
    pub fn is_complete(&self) -> bool {
        self.status() != 0
    }

    /// The buffer the accelerator reads from.
    pub fn source(&self) -> &AlignedBuffer {
        self.source
    }

    /// The buffer the accelerator writes to, once it has finished.
    ///
    /// Returns `None` until the status flag is observed non-zero. The
    /// acquire load behind that check makes every line the accelerator
    /// wrote before raising the flag visible to the returned view.
    pub fn destination(&self) -> Option<&AlignedBuffer> {
        self.is_complete().then_some(&*self.destination)
    }
}
