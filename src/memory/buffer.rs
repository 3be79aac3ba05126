//! A sized, device-located memory block with explicit ownership.
//!
//! A `Buffer` either owns its block (obtained from an allocator, released
//! through that allocator exactly once, at drop) or borrows externally owned
//! memory it must never release. Buffers are shared between tensors through
//! `Arc` and are deliberately not `Clone`: a copied Buffer would mean two
//! owners for one pointer.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::status::{Result, Status};

use super::alloc::{DeviceAllocator, DeviceAllocatorFactory, DeviceType, MemcpyKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Owned,
    External,
}

pub struct Buffer {
    byte_size: usize,
    ptr: *mut u8,
    device_type: DeviceType,
    ownership: Ownership,
    allocator: Option<Arc<dyn DeviceAllocator>>,
}

// SAFETY: the block pointer is released exactly once (guarded by the
// ownership flag), and mutating accesses through it are serialized by the
// caller under the crate's single-writer discipline.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate an owned block of `byte_size` bytes from `allocator`.
    pub fn alloc(byte_size: usize, allocator: Arc<dyn DeviceAllocator>) -> Result<Self> {
        let device_type = allocator.device_type();
        let mut buffer = Self {
            byte_size,
            ptr: std::ptr::null_mut(),
            device_type,
            ownership: Ownership::Owned,
            allocator: Some(allocator),
        };
        buffer.allocate()?;
        Ok(buffer)
    }

    /// Borrow an externally owned block. The memory's lifetime is managed by
    /// whoever passed the pointer in; this buffer never releases it.
    pub fn external(byte_size: usize, ptr: NonNull<u8>, device_type: DeviceType) -> Self {
        Self {
            byte_size,
            ptr: ptr.as_ptr(),
            device_type,
            ownership: Ownership::External,
            allocator: None,
        }
    }

    /// Take ownership of a caller-supplied block that came out of
    /// `allocator`. The buffer releases it through that allocator at drop.
    pub fn adopt(byte_size: usize, ptr: NonNull<u8>, allocator: Arc<dyn DeviceAllocator>) -> Self {
        let device_type = allocator.device_type();
        Self {
            byte_size,
            ptr: ptr.as_ptr(),
            device_type,
            ownership: Ownership::Owned,
            allocator: Some(allocator),
        }
    }

    /// (Re)allocate from the bound allocator, releasing any block currently
    /// owned.
    pub fn allocate(&mut self) -> Result<()> {
        let Some(allocator) = self.allocator.clone() else {
            return Err(Status::allocate_failed("no allocator bound to this buffer"));
        };
        if self.byte_size == 0 {
            return Err(Status::invalid_argument(
                "cannot allocate a zero-byte buffer",
            ));
        }
        self.release_owned();
        match allocator.allocate(self.byte_size) {
            Some(ptr) => {
                self.ptr = ptr.as_ptr();
                self.ownership = Ownership::Owned;
                self.device_type = allocator.device_type();
                Ok(())
            }
            None => Err(Status::allocate_failed(format!(
                "allocator returned no block for {} bytes",
                self.byte_size
            ))),
        }
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn ptr_mut(&self) -> *mut u8 {
        self.ptr
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Record the locality of an externally supplied block whose device kind
    /// was not known at construction.
    pub fn set_device_type(&mut self, device_type: DeviceType) {
        self.device_type = device_type;
    }

    pub fn allocator(&self) -> Option<Arc<dyn DeviceAllocator>> {
        self.allocator.clone()
    }

    pub fn is_external(&self) -> bool {
        self.ownership == Ownership::External
    }

    /// Copy `min(self, other)` byte sizes from `other` into `self`, deriving
    /// the transfer kind from both endpoints' device kinds. This is the sole
    /// place where mismatched-device copies are resolved.
    ///
    /// # Panics
    ///
    /// Both buffers must hold non-null pointers; copying through a null
    /// pointer is a contract violation.
    pub fn copy_from(&self, other: &Buffer) -> Result<()> {
        assert!(
            !self.ptr.is_null() && !other.ptr.is_null(),
            "copy_from through a null buffer pointer"
        );
        let byte_size = self.byte_size.min(other.byte_size);
        let kind = match (other.device_type, self.device_type) {
            (DeviceType::Cpu, DeviceType::Cpu) => MemcpyKind::HostToHost,
            (DeviceType::Cpu, DeviceType::Cuda) => MemcpyKind::HostToDevice,
            (DeviceType::Cuda, DeviceType::Cpu) => MemcpyKind::DeviceToHost,
            (DeviceType::Cuda, DeviceType::Cuda) => MemcpyKind::DeviceToDevice,
            _ => {
                return Err(Status::device_mismatch(
                    "copy endpoints must both have a known device type",
                ))
            }
        };
        let allocator = self.transfer_allocator(other, kind)?;
        allocator.memcpy(other.ptr, self.ptr, byte_size, kind, None, false)
    }

    /// Host-only copies go through the destination's allocator; any copy
    /// touching the device goes through a device-capable allocator.
    fn transfer_allocator(
        &self,
        other: &Buffer,
        kind: MemcpyKind,
    ) -> Result<Arc<dyn DeviceAllocator>> {
        if kind == MemcpyKind::HostToHost {
            return self.allocator.clone().ok_or_else(|| {
                Status::invalid_argument("destination buffer has no allocator bound")
            });
        }
        let device_side = [self, other]
            .into_iter()
            .filter(|b| b.device_type == DeviceType::Cuda)
            .find_map(|b| b.allocator.clone());
        Ok(match device_side {
            Some(allocator) => allocator,
            None => DeviceAllocatorFactory::cuda(),
        })
    }

    fn release_owned(&mut self) {
        if self.ownership == Ownership::Owned && !self.ptr.is_null() {
            if let Some(allocator) = &self.allocator {
                allocator.release(self.ptr);
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release_owned();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("byte_size", &self.byte_size)
            .field("ptr", &self.ptr)
            .field("device_type", &self.device_type)
            .field("ownership", &self.ownership)
            .finish()
    }
}
