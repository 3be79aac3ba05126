// Copyright 2025-2026 KILN-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Device allocator contract shared by the CPU and GPU implementations.
//!
//! An allocator hands out raw device blocks and takes them back; it never
//! tracks who is using a block. Ownership discipline lives one layer up in
//! [`Buffer`](super::Buffer), which guarantees exactly one `release` per
//! owned pointer.

use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use crate::config::CachingAllocatorConfig;
use crate::status::Result;

use super::cpu::CpuDeviceAllocator;
use super::gpu::{CachingGpuAllocator, EmulatedGpuRuntime};

/// Physical location of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Unknown => write!(f, "unknown"),
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda => write!(f, "cuda"),
        }
    }
}

/// Direction of a memory copy. The caller supplies the kind matching both
/// endpoints; allocators do not infer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Opaque handle for asynchronous device copies. A real device runtime maps
/// this onto its own stream type; the emulated runtime ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStream(pub u64);

/// Capability contract implemented once per device kind.
///
/// The raw-pointer operations carry C-style contracts: `memcpy` regions must
/// not overlap, pointers must be live for `byte_size` bytes on the device the
/// kind names, and `release` must see each pointer at most once.
pub trait DeviceAllocator: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// Obtain a block of at least `byte_size` bytes, suitably aligned for the
    /// device. Returns `None` for zero-size requests and on exhaustion.
    fn allocate(&self, byte_size: usize) -> Option<NonNull<u8>>;

    /// Return a block. No-op on null input.
    fn release(&self, ptr: *mut u8);

    /// Copy `byte_size` bytes from `src` to `dst` in the direction `kind`.
    /// With a stream and `need_sync = false` the copy may complete
    /// asynchronously; ordering relative to later use is then the caller's
    /// responsibility.
    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<DeviceStream>,
        need_sync: bool,
    ) -> Result<()>;

    /// Zero-fill a block.
    fn memset_zero(
        &self,
        ptr: *mut u8,
        byte_size: usize,
        stream: Option<DeviceStream>,
        need_sync: bool,
    ) -> Result<()>;
}

/// Process-wide singleton allocators, one per device kind.
///
/// Components that want fake allocators for testing should take an injected
/// `Arc<dyn DeviceAllocator>` instead; the factory exists for call sites like
/// device migration that must conjure the counterpart device's allocator.
pub struct DeviceAllocatorFactory;

impl DeviceAllocatorFactory {
    pub fn cpu() -> Arc<CpuDeviceAllocator> {
        static CPU: OnceLock<Arc<CpuDeviceAllocator>> = OnceLock::new();
        CPU.get_or_init(|| Arc::new(CpuDeviceAllocator::new())).clone()
    }

    pub fn cuda() -> Arc<CachingGpuAllocator> {
        static CUDA: OnceLock<Arc<CachingGpuAllocator>> = OnceLock::new();
        CUDA.get_or_init(|| {
            Arc::new(CachingGpuAllocator::new(
                Arc::new(EmulatedGpuRuntime::new(0)),
                CachingAllocatorConfig::from_env(),
            ))
        })
        .clone()
    }

    /// Singleton allocator for `device_type`.
    ///
    /// # Panics
    ///
    /// Requesting an allocator for [`DeviceType::Unknown`] is a fatal
    /// configuration error and aborts.
    pub fn instance(device_type: DeviceType) -> Arc<dyn DeviceAllocator> {
        match device_type {
            DeviceType::Cpu => Self::cpu(),
            DeviceType::Cuda => Self::cuda(),
            DeviceType::Unknown => {
                panic!("no allocator exists for the unknown device type")
            }
        }
    }
}
