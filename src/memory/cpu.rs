//! Host memory allocator.
//!
//! Alignment is size-dependent: 32 bytes for requests of 1 KiB and above
//! (cache-line-friendly for large buffers), 16 bytes below that. The
//! allocator keeps a pointer-to-layout map so `release` can hand the exact
//! `Layout` back to the global allocator.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use tracing::error;

use crate::status::{Result, Status};

use super::alloc::{DeviceAllocator, DeviceStream, DeviceType, MemcpyKind};

fn alignment_for(byte_size: usize) -> usize {
    if byte_size >= 1024 {
        32
    } else {
        16
    }
}

/// Host-side allocator. Stateless apart from the layout bookkeeping.
pub struct CpuDeviceAllocator {
    layouts: Mutex<HashMap<usize, Layout>>,
}

impl CpuDeviceAllocator {
    pub fn new() -> Self {
        Self {
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks handed out and not yet released. Used by leak-checking tests.
    pub fn live_allocations(&self) -> usize {
        self.layouts.lock().len()
    }
}

impl Default for CpuDeviceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for CpuDeviceAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn allocate(&self, byte_size: usize) -> Option<NonNull<u8>> {
        if byte_size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(byte_size, alignment_for(byte_size)).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw)?;
        self.layouts.lock().insert(raw as usize, layout);
        Some(ptr)
    }

    fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        match self.layouts.lock().remove(&(ptr as usize)) {
            // SAFETY: ptr came out of `allocate` with exactly this layout and
            // has not been released before (the map entry still existed).
            Some(layout) => unsafe { dealloc(ptr, layout) },
            None => error!(?ptr, "release of a pointer the cpu allocator never handed out"),
        }
    }

    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        kind: MemcpyKind,
        _stream: Option<DeviceStream>,
        _need_sync: bool,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        match kind {
            MemcpyKind::HostToHost => {
                assert!(
                    !src.is_null() && !dst.is_null(),
                    "memcpy through a null host pointer"
                );
                // SAFETY: caller guarantees both regions are live for
                // byte_size bytes and do not overlap.
                unsafe { ptr::copy_nonoverlapping(src, dst, byte_size) };
                Ok(())
            }
            _ => Err(Status::not_implemented(format!(
                "cpu allocator cannot perform {kind:?} copies; use the gpu allocator"
            ))),
        }
    }

    fn memset_zero(
        &self,
        ptr: *mut u8,
        byte_size: usize,
        _stream: Option<DeviceStream>,
        _need_sync: bool,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        assert!(!ptr.is_null(), "memset_zero through a null host pointer");
        // SAFETY: caller guarantees the region is live for byte_size bytes.
        unsafe { ptr::write_bytes(ptr, 0, byte_size) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_tracks_request_size() {
        let alloc = CpuDeviceAllocator::new();
        let small = alloc.allocate(64).unwrap();
        assert_eq!(small.as_ptr() as usize % 16, 0);
        let large = alloc.allocate(4096).unwrap();
        assert_eq!(large.as_ptr() as usize % 32, 0);
        alloc.release(small.as_ptr());
        alloc.release(large.as_ptr());
        assert_eq!(alloc.live_allocations(), 0);
    }

    #[test]
    fn zero_size_request_returns_none() {
        let alloc = CpuDeviceAllocator::new();
        assert!(alloc.allocate(0).is_none());
    }

    #[test]
    fn release_of_null_is_a_no_op() {
        let alloc = CpuDeviceAllocator::new();
        alloc.release(std::ptr::null_mut());
    }
}
