//! Common definitions shared by the host driver, the libcxl bindings and the
//! software accelerator model.
//!
//! This crate provides the coherent-attach memory geometry, the well-known
//! MMIO register offsets of the memcopy AFU, the device paths of the
//! simulation and hardware builds, and the bit-exact layout of the work
//! element descriptor handed to the accelerator.

#![no_std]

// Memory-mapped I/O and interconnect geometry of the memcopy AFU.
//
// These values must match the accelerator design loaded on the card (or the
// simulation model behind PSLSE); changing any of them breaks
// interoperability with real hardware.
pub mod mmio {
    /// Width of one cache line on the coherent interconnect.
    ///
    /// The PSL only guarantees coherent, atomic visibility between host and
    /// accelerator at this granularity. Every buffer handed to the AFU, the
    /// descriptor included, starts on a multiple of this value and is sized in
    /// whole lines.
    pub const CACHELINE_BYTES: usize = 128;

    /// Number of 64-bit words in one cache line.
    pub const CACHELINE_WORDS: usize = CACHELINE_BYTES / 8;

    /// Offset of the response counter register in the AFU's problem-state
    /// MMIO space.
    ///
    /// The AFU increments this register for every response it receives from
    /// the PSL, so successive reads give the host a liveness signal while it
    /// waits for the status flag. The offset is a byte address; the AFU sees
    /// it as word address `0xfffffe`.
    pub const RESPONSE_COUNTER: u64 = 0x3ff_fff8;

    /// Character device of the AFU instance exposed by PSLSE in simulation.
    pub const SIM_DEVICE: &str = "/dev/cxl/afu0.0d";

    /// Character device of the AFU instance on the physical card.
    pub const HW_DEVICE: &str = "/dev/cxl/afu1.0d";

    /// Device opened when the caller does not name one.
    ///
    /// Selected at build time through the `sim` feature; there is no
    /// run-time switch between simulation and hardware.
    #[cfg(feature = "sim")]
    pub const DEFAULT_DEVICE: &str = SIM_DEVICE;

    /// Device opened when the caller does not name one.
    ///
    /// Selected at build time through the `sim` feature; there is no
    /// run-time switch between simulation and hardware.
    #[cfg(not(feature = "sim"))]
    pub const DEFAULT_DEVICE: &str = HW_DEVICE;
}

/// Work element descriptor exchanged between host and accelerator.
///
/// The descriptor is the only data structure the AFU reads from the host at
/// attach time. Its layout is the wire format of the host/accelerator
/// handshake and must be reproduced bit-exact.
pub mod wed {
    use crate::mmio::CACHELINE_BYTES;
    use core::mem::{align_of, offset_of, size_of};
    use core::sync::atomic::AtomicU8;

    /// Number of reserved 64-bit words padding the descriptor to one line.
    pub const RESERVED_WORDS: usize = 13;

    /// Fixed-layout job descriptor for one memcopy job.
    ///
    /// Occupies exactly one cache line and must start on a cache-line
    /// boundary. Field order and widths follow the AFU's bit numbering, low
    /// bits first:
    ///
    /// ```text
    /// 7    ..    0  status
    /// 15   ..    8  operation_tag
    /// 31   ..   16  reserved16
    /// 63   ..   32  size
    /// 127  ..   64  source
    /// 191  ..  128  destination
    /// 1023 ..  192  reserved[0..13]
    /// ```
    ///
    /// An all-zero bit pattern is a valid descriptor, which lets the host
    /// obtain one from zeroed, aligned memory.
    #[repr(C, align(128))]
    pub struct WorkElementDescriptor {
        /// Completion flag.
        ///
        /// Zero when handed to the accelerator; the AFU writes a non-zero
        /// value once the whole job has been written back. Held as an atomic
        /// byte so that every host read is a fresh acquire load rather than a
        /// cached value.
        pub status: AtomicU8,

        /// Accelerator-defined operation metadata. Not interpreted by the host.
        pub operation_tag: u8,

        /// Accelerator-defined metadata. Not interpreted by the host.
        pub reserved16: u16,

        /// Number of cache lines to copy.
        pub size: u32,

        /// Address of the source buffer.
        pub source: u64,

        /// Address of the destination buffer.
        pub destination: u64,

        /// Padding out to the full cache line. Always zero.
        pub reserved: [u64; RESERVED_WORDS],
    }

    const _: () = assert!(size_of::<WorkElementDescriptor>() == CACHELINE_BYTES);
    const _: () = assert!(align_of::<WorkElementDescriptor>() == CACHELINE_BYTES);
    const _: () = assert!(offset_of!(WorkElementDescriptor, status) == 0);
    const _: () = assert!(offset_of!(WorkElementDescriptor, operation_tag) == 1);
    const _: () = assert!(offset_of!(WorkElementDescriptor, reserved16) == 2);
    const _: () = assert!(offset_of!(WorkElementDescriptor, size) == 4);
    const _: () = assert!(offset_of!(WorkElementDescriptor, source) == 8);
    const _: () = assert!(offset_of!(WorkElementDescriptor, destination) == 16);
    const _: () = assert!(offset_of!(WorkElementDescriptor, reserved) == 24);
}
