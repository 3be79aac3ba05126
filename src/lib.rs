//! KILN-CORE tensor memory substrate
//!
//! The memory-management layer under the Kiln inference runtime: how raw
//! host/device memory is obtained, pooled, shared, and released, and how
//! tensors are built on top of it without double-frees, use-after-free, or
//! needless copies.
//!
//! # Layering
//!
//! - **Allocators** ([`memory::DeviceAllocator`]): the CPU allocator and the
//!   pooling GPU allocator obtain and return raw device blocks.
//! - **Buffers** ([`memory::Buffer`]): one contiguous block on one device,
//!   with explicit owning/borrowing semantics and exactly-once release.
//! - **Tensors** ([`tensor::Tensor`]): shape/stride/dtype views sharing a
//!   buffer; reshape, deep clone, and cross-device migration.
//!
//! # Concurrency
//!
//! Allocator pool state is lock-protected and safe to call from any thread.
//! Tensors follow a single-writer discipline: one logical owner mutates,
//! other holders read; concurrent mutation must be serialized by the caller.

pub mod config;
pub mod memory;
pub mod status;
pub mod telemetry;
pub mod tensor;

pub use config::CachingAllocatorConfig;
pub use memory::{
    Buffer, CachingGpuAllocator, CpuDeviceAllocator, DeviceAllocator, DeviceAllocatorFactory,
    DeviceStream, DeviceType, EmulatedGpuRuntime, GpuRuntime, MemcpyKind,
};
pub use status::{Result, Status, StatusCode};
pub use tensor::{DataType, Element, Tensor};

use std::sync::Arc;

/// Explicitly wired allocator set, for callers that prefer dependency
/// injection over the process-wide [`DeviceAllocatorFactory`].
pub struct MemoryRuntime {
    pub cpu: Arc<CpuDeviceAllocator>,
    pub gpu: Arc<CachingGpuAllocator>,
}

impl MemoryRuntime {
    pub fn new(config: CachingAllocatorConfig) -> Self {
        Self {
            cpu: Arc::new(CpuDeviceAllocator::new()),
            gpu: Arc::new(CachingGpuAllocator::new(
                Arc::new(EmulatedGpuRuntime::new(0)),
                config,
            )),
        }
    }

    /// Allocator for `device_type`.
    ///
    /// # Panics
    ///
    /// Requesting [`DeviceType::Unknown`] is a configuration error.
    pub fn allocator(&self, device_type: DeviceType) -> Arc<dyn DeviceAllocator> {
        match device_type {
            DeviceType::Cpu => self.cpu.clone(),
            DeviceType::Cuda => self.gpu.clone(),
            DeviceType::Unknown => panic!("no allocator exists for the unknown device type"),
        }
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new(CachingAllocatorConfig::default())
    }
}
