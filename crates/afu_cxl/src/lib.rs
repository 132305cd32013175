//! libcxl backend for the memcopy AFU.
//!
//! Provides a Rust interface to the native accelerator-access library used
//! with CAPI cards and with the PSLSE simulation environment. The library
//! opens the AFU's character device, attaches a work element descriptor to
//! a new context and maps the AFU's problem-state MMIO space.

use afu_core::AfuError;
use afu_core::session::{Accelerator, Endianness};
use std::ffi::{CString, c_char, c_int};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Opaque handle to an AFU context owned by libcxl.
#[repr(C)]
pub struct CxlAfuHandle {
    _private: [u8; 0],
}

/// MMIO register byte order flags accepted by `cxl_mmio_map`.
pub const CXL_MMIO_BIG_ENDIAN: u32 = 0x1;
pub const CXL_MMIO_LITTLE_ENDIAN: u32 = 0x2;
pub const CXL_MMIO_HOST_ENDIAN: u32 = 0x3;

/// Foreign function interface to libcxl.
///
/// All functions report failure through a negative return value or a null
/// handle, with the cause left in `errno`.
unsafe extern "C" {
    /// Opens the AFU character device at `path` and allocates a context.
    fn cxl_afu_open_dev(path: *mut c_char) -> *mut CxlAfuHandle;

    /// Attaches the context, handing the AFU the work element descriptor at
    /// address `wed`, and starts it.
    fn cxl_afu_attach(afu: *mut CxlAfuHandle, wed: u64) -> c_int;

    /// Maps the problem-state MMIO space with the given byte order flags.
    fn cxl_mmio_map(afu: *mut CxlAfuHandle, flags: u32) -> c_int;

    /// Reads the 64-bit register at byte `offset` into `data`.
    fn cxl_mmio_read64(afu: *mut CxlAfuHandle, offset: u64, data: *mut u64) -> c_int;

    /// Unmaps the MMIO space.
    fn cxl_mmio_unmap(afu: *mut CxlAfuHandle) -> c_int;

    /// Detaches the context and closes the device.
    fn cxl_afu_free(afu: *mut CxlAfuHandle);
}

/// Translates a register byte order into `cxl_mmio_map` flags.
pub fn mmio_flags(endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Big => CXL_MMIO_BIG_ENDIAN,
        Endianness::Little => CXL_MMIO_LITTLE_ENDIAN,
        Endianness::Host => CXL_MMIO_HOST_ENDIAN,
    }
}

/// One AFU context opened through libcxl.
///
/// Closing (explicitly or on drop) unmaps the MMIO space if needed and frees
/// the context, which detaches the AFU from the descriptor.
pub struct CxlAfu {
    handle: Option<NonNull<CxlAfuHandle>>,
    device: PathBuf,
    mapped: bool,
}

impl CxlAfu {
    /// Opens the AFU device at `device`.
    ///
    /// # Returns
    ///
    /// The opened context, or [`AfuError::DeviceOpen`] carrying `errno` if
    /// the device is absent, not accessible, or already claimed.
    pub fn open(device: impl AsRef<Path>) -> Result<Self, AfuError> {
        let device = device.as_ref().to_path_buf();
        let open_err = |source| AfuError::DeviceOpen {
            path: device.display().to_string(),
            source,
        };

        let path = CString::new(device.as_os_str().as_bytes())
            .map_err(|e| open_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        // SAFETY: path is a valid NUL-terminated string that libcxl copies.
        let raw = unsafe { cxl_afu_open_dev(path.as_ptr().cast_mut()) };
        let handle = NonNull::new(raw).ok_or_else(|| open_err(io::Error::last_os_error()))?;

        tracing::info!(device = %device.display(), "opened AFU device");
        Ok(Self {
            handle: Some(handle),
            device,
            mapped: false,
        })
    }

    /// Path the context was opened from.
    pub fn device(&self) -> &Path {
        &self.device
    }

    fn handle(&self) -> Result<*mut CxlAfuHandle, io::Error> {
        self.handle
            .map(NonNull::as_ptr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Accelerator for CxlAfu {
    unsafe fn attach(&mut self, wed_addr: u64) -> Result<(), AfuError> {
        let afu = self.handle().map_err(|source| AfuError::Attach { source })?;
        // SAFETY: afu is a live context; the caller keeps the descriptor
        // valid until close.
        if unsafe { cxl_afu_attach(afu, wed_addr) } < 0 {
            return Err(AfuError::Attach {
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn map_mmio(&mut self, endianness: Endianness) -> Result<(), AfuError> {
        let afu = self.handle().map_err(|source| AfuError::MmioMap { source })?;
        // SAFETY: afu is a live, attached context.
        if unsafe { cxl_mmio_map(afu, mmio_flags(endianness)) } < 0 {
            return Err(AfuError::MmioMap {
                source: io::Error::last_os_error(),
            });
        }
        self.mapped = true;
        Ok(())
    }

    fn read_mmio64(&mut self, offset: u64) -> Result<u64, AfuError> {
        if !self.mapped {
            return Err(AfuError::MmioNotMapped { offset });
        }
        let afu = self
            .handle()
            .map_err(|source| AfuError::MmioRead { offset, source })?;
        let mut value = 0u64;
        // SAFETY: afu is live and mapped; value is a valid out pointer.
        if unsafe { cxl_mmio_read64(afu, offset, &mut value) } < 0 {
            return Err(AfuError::MmioRead {
                offset,
                source: io::Error::last_os_error(),
            });
        }
        Ok(value)
    }

    fn unmap_mmio(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        if let Ok(afu) = self.handle() {
            // SAFETY: afu is live and currently mapped.
            if unsafe { cxl_mmio_unmap(afu) } < 0 {
                tracing::warn!(error = %io::Error::last_os_error(), "cxl_mmio_unmap failed");
            }
        }
    }

    fn close(&mut self) {
        self.unmap_mmio();
        if let Some(handle) = self.handle.take() {
            // SAFETY: handle came from cxl_afu_open_dev and is freed once.
            unsafe { cxl_afu_free(handle.as_ptr()) };
            tracing::debug!(device = %self.device.display(), "AFU context freed");
        }
    }
}

impl Drop for CxlAfu {
    fn drop(&mut self) {
        self.close();
    }
}
