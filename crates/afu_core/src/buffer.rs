use crate::AfuError;
use afu_common::mmio::CACHELINE_BYTES;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Zeroed heap allocation with a caller-chosen alignment.
///
/// The buffer owns its memory for its whole lifetime. Handing a buffer to
/// [`crate::descriptor::WorkElement::new`] borrows it for as long as the
/// descriptor lives: the source shared, since the accelerator only reads it,
/// and the destination exclusively, so no slice over the destination can be
/// formed while the accelerator may be writing it.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; no thread-local state.
unsafe impl Send for AlignedBuffer {}

// SAFETY: shared access only hands out `&[u8]`; mutation needs `&mut self`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates `size` zeroed bytes aligned to `align`.
    ///
    /// # Arguments
    ///
    /// * `size` - Number of bytes, must be non-zero
    /// * `align` - Alignment in bytes, must be a power of two
    ///
    /// # Returns
    ///
    /// The buffer, or [`AfuError::Allocation`] when the size is zero, the
    /// alignment is not a power of two, or the allocator is out of memory.
    pub fn allocate(size: usize, align: usize) -> Result<Self, AfuError> {
        let err = || AfuError::Allocation { size, align };

        if size == 0 {
            return Err(err());
        }
        let layout = Layout::from_size_align(size, align).map_err(|_| err())?;

        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(err)?;

        tracing::trace!(size, align, addr = ?ptr, "aligned allocation");
        Ok(Self { ptr, layout })
    }

    /// Allocates `lines` zeroed cache lines on a cache-line boundary.
    pub fn cachelines(lines: usize) -> Result<Self, AfuError> {
        let size = lines
            .checked_mul(CACHELINE_BYTES)
            .ok_or(AfuError::Allocation {
                size: usize::MAX,
                align: CACHELINE_BYTES,
            })?;
        Self::allocate(size, CACHELINE_BYTES)
    }

    /// Size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Always false: zero-sized buffers are rejected at allocation.
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Alignment the buffer was allocated with.
    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address of the buffer as published to the accelerator.
    ///
    /// The pointer's provenance is exposed so that a backend reconstructing
    /// the pointer from this integer (as the software AFU model does) stays
    /// within the allocation.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr().expose_provenance() as u64
    }

    /// Views the whole buffer as bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialised (zeroed) bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// Views the buffer as 64-bit words.
    ///
    /// Bytes before the first 8-byte boundary or after the last whole word
    /// are not included; for buffers aligned to at least 8 bytes with a
    /// length that is a multiple of 8 the view covers the whole buffer.
    pub fn words_mut(&mut self) -> &mut [u64] {
        // SAFETY: every bit pattern is a valid u64.
        let (_, words, _) = unsafe { self.as_mut_slice().align_to_mut::<u64>() };
        words
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len())
            .field("align", &self.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cachelines_are_line_aligned_and_zeroed() {
        for lines in [1, 2, 4, 33] {
            let buf = AlignedBuffer::cachelines(lines).unwrap();
            assert_eq!(buf.len(), lines * CACHELINE_BYTES);
            assert_eq!(buf.addr() % CACHELINE_BYTES as u64, 0);
            assert!(buf.as_slice().iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        for align in [0, 3, 96, 129] {
            let err = AlignedBuffer::allocate(256, align).unwrap_err();
            assert!(matches!(err, AfuError::Allocation { size: 256, align: a } if a == align));
        }
    }

    #[test]
    fn rejects_zero_size() {
        assert!(matches!(
            AlignedBuffer::allocate(0, CACHELINE_BYTES),
            Err(AfuError::Allocation { size: 0, .. })
        ));
        assert!(AlignedBuffer::cachelines(0).is_err());
    }

    #[test]
    fn rejects_line_count_overflow() {
        assert!(matches!(
            AlignedBuffer::cachelines(usize::MAX),
            Err(AfuError::Allocation { .. })
        ));
    }

    #[test]
    fn words_cover_whole_buffer() {
        let mut buf = AlignedBuffer::cachelines(2).unwrap();
        let words = buf.words_mut();
        assert_eq!(words.len(), 32);
        for (i, w) in words.iter_mut().enumerate() {
            *w = i as u64;
        }
        assert_eq!(&buf.as_slice()[8..16], &1u64.to_ne_bytes());
    }
}
