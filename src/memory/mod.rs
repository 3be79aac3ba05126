//! Memory management for the tensor substrate.
//!
//! Three layers: a [`DeviceAllocator`] obtains raw device blocks, a
//! [`Buffer`] wraps one block with owning/borrowing semantics, and
//! [`Tensor`](crate::tensor::Tensor) binds shape metadata to a shared Buffer.

mod alloc;
mod buffer;
mod cpu;
mod gpu;

pub use alloc::{DeviceAllocator, DeviceAllocatorFactory, DeviceStream, DeviceType, MemcpyKind};
pub use buffer::Buffer;
pub use cpu::CpuDeviceAllocator;
#[cfg(feature = "cuda")]
pub use gpu::CudaGpuRuntime;
pub use gpu::{CachingGpuAllocator, EmulatedGpuRuntime, GpuRuntime};
