// Copyright 2025-2026 KILN-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Caching device allocator.
//!
//! Device allocation and free are expensive relative to host malloc, so this
//! allocator keeps released blocks resident in per-device pools (a large and
//! a small size class) and reuses them for later requests. A released block
//! is only marked non-busy; physical frees happen when the resident free
//! bytes exceed the configured budget, or at allocator teardown.
//!
//! The raw device primitives sit behind [`GpuRuntime`]. The default
//! [`EmulatedGpuRuntime`] is host-backed so the crate is fully exercisable
//! without device hardware; a CUDA-backed runtime plugs in behind the `cuda`
//! feature.

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::config::CachingAllocatorConfig;
use crate::status::Result;

use super::alloc::{DeviceAllocator, DeviceStream, DeviceType, MemcpyKind};

/// Raw device-memory primitives the caching allocator sits on.
pub trait GpuRuntime: Send + Sync {
    /// Index of the device all subsequent calls act on.
    fn current_device(&self) -> usize;

    /// Raw device allocation. `None` on exhaustion.
    fn malloc(&self, byte_size: usize) -> Option<NonNull<u8>>;

    /// Raw device free. The pointer must have come out of `malloc`.
    fn free(&self, ptr: NonNull<u8>);

    /// Directional copy between host and device address spaces.
    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<DeviceStream>,
    ) -> Result<()>;

    /// Fill `byte_size` bytes at `ptr` with `value`.
    fn memset(
        &self,
        ptr: *mut u8,
        value: u8,
        byte_size: usize,
        stream: Option<DeviceStream>,
    ) -> Result<()>;

    /// Block until work queued on `stream` (or the whole device) completes.
    fn synchronize(&self, stream: Option<DeviceStream>);
}

// Device-like base alignment for emulated blocks.
const EMULATED_ALIGN: usize = 256;

/// Host-backed runtime standing in for a device driver.
///
/// Instrumented with raw allocation counters so tests can assert the caching
/// allocator actually reuses pooled blocks instead of hitting the runtime.
pub struct EmulatedGpuRuntime {
    device_index: usize,
    layouts: Mutex<HashMap<usize, Layout>>,
    mallocs: AtomicUsize,
    frees: AtomicUsize,
}

impl EmulatedGpuRuntime {
    pub fn new(device_index: usize) -> Self {
        Self {
            device_index,
            layouts: Mutex::new(HashMap::new()),
            mallocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    /// Number of raw `malloc` calls served so far.
    pub fn device_malloc_count(&self) -> usize {
        self.mallocs.load(Ordering::Relaxed)
    }

    /// Number of raw `free` calls served so far.
    pub fn device_free_count(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }
}

impl GpuRuntime for EmulatedGpuRuntime {
    fn current_device(&self) -> usize {
        self.device_index
    }

    fn malloc(&self, byte_size: usize) -> Option<NonNull<u8>> {
        if byte_size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(byte_size, EMULATED_ALIGN).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw)?;
        self.layouts.lock().insert(raw as usize, layout);
        self.mallocs.fetch_add(1, Ordering::Relaxed);
        Some(ptr)
    }

    fn free(&self, ptr: NonNull<u8>) {
        match self.layouts.lock().remove(&(ptr.as_ptr() as usize)) {
            Some(layout) => {
                // SAFETY: ptr came out of `malloc` with exactly this layout.
                unsafe { dealloc(ptr.as_ptr(), layout) };
                self.frees.fetch_add(1, Ordering::Relaxed);
            }
            None => error!(?ptr, "free of a pointer the emulated runtime never handed out"),
        }
    }

    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        _kind: MemcpyKind,
        _stream: Option<DeviceStream>,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        assert!(
            !src.is_null() && !dst.is_null(),
            "device memcpy through a null pointer"
        );
        // Every direction is a host copy in the emulated runtime.
        // SAFETY: caller guarantees both regions are live and disjoint.
        unsafe { ptr::copy_nonoverlapping(src, dst, byte_size) };
        Ok(())
    }

    fn memset(
        &self,
        ptr: *mut u8,
        value: u8,
        byte_size: usize,
        _stream: Option<DeviceStream>,
    ) -> Result<()> {
        if byte_size == 0 {
            return Ok(());
        }
        assert!(!ptr.is_null(), "device memset through a null pointer");
        // SAFETY: caller guarantees the region is live for byte_size bytes.
        unsafe { ptr::write_bytes(ptr, value, byte_size) };
        Ok(())
    }

    fn synchronize(&self, _stream: Option<DeviceStream>) {
        // Emulated copies complete eagerly; nothing to wait for.
    }
}

// -- CUDA runtime stub --------------------------------------------------------

/// CUDA-backed runtime. Currently delegates to host emulation.
#[cfg(feature = "cuda")]
pub struct CudaGpuRuntime {
    inner: EmulatedGpuRuntime,
}

#[cfg(feature = "cuda")]
impl CudaGpuRuntime {
    pub fn new(device_index: usize) -> Self {
        Self {
            inner: EmulatedGpuRuntime::new(device_index),
        }
    }
}

#[cfg(feature = "cuda")]
impl GpuRuntime for CudaGpuRuntime {
    fn current_device(&self) -> usize {
        self.inner.current_device()
    }

    fn malloc(&self, byte_size: usize) -> Option<NonNull<u8>> {
        // TODO: replace with cudarc::driver raw allocations once the driver
        // surface is wired up.
        self.inner.malloc(byte_size)
    }

    fn free(&self, ptr: NonNull<u8>) {
        self.inner.free(ptr)
    }

    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<DeviceStream>,
    ) -> Result<()> {
        self.inner.memcpy(src, dst, byte_size, kind, stream)
    }

    fn memset(
        &self,
        ptr: *mut u8,
        value: u8,
        byte_size: usize,
        stream: Option<DeviceStream>,
    ) -> Result<()> {
        self.inner.memset(ptr, value, byte_size, stream)
    }

    fn synchronize(&self, stream: Option<DeviceStream>) {
        self.inner.synchronize(stream)
    }
}

// -- Pools --------------------------------------------------------------------

/// A pooled device block. `busy` while lent out.
struct MemoryBlock {
    ptr: NonNull<u8>,
    byte_size: usize,
    busy: bool,
}

#[derive(Default)]
struct DevicePools {
    /// Both pools stay sorted ascending by `byte_size`, so a first-fit scan
    /// returns the smallest free block that satisfies the request.
    large: Vec<MemoryBlock>,
    small: Vec<MemoryBlock>,
    busy_count: usize,
}

impl DevicePools {
    fn free_bytes(&self) -> usize {
        self.large
            .iter()
            .chain(self.small.iter())
            .filter(|b| !b.busy)
            .map(|b| b.byte_size)
            .sum()
    }
}

fn insert_sorted(pool: &mut Vec<MemoryBlock>, block: MemoryBlock) {
    let at = pool.partition_point(|b| b.byte_size < block.byte_size);
    pool.insert(at, block);
}

fn round_up(byte_size: usize, granularity: usize) -> usize {
    byte_size.div_ceil(granularity) * granularity
}

/// Pooling allocator for device memory.
pub struct CachingGpuAllocator {
    runtime: Arc<dyn GpuRuntime>,
    config: CachingAllocatorConfig,
    pools: Mutex<HashMap<usize, DevicePools>>,
}

// SAFETY: pooled block pointers are only reachable through the mutex, and a
// block is handed to at most one holder at a time (the busy flag).
unsafe impl Send for CachingGpuAllocator {}
unsafe impl Sync for CachingGpuAllocator {}

impl CachingGpuAllocator {
    pub fn new(runtime: Arc<dyn GpuRuntime>, config: CachingAllocatorConfig) -> Self {
        Self {
            runtime,
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CachingAllocatorConfig {
        &self.config
    }

    /// Bytes held in non-busy pooled blocks across all devices.
    pub fn resident_free_bytes(&self) -> usize {
        self.pools.lock().values().map(DevicePools::free_bytes).sum()
    }

    /// Blocks currently lent out across all devices.
    pub fn busy_blocks(&self) -> usize {
        self.pools.lock().values().map(|p| p.busy_count).sum()
    }

    /// Physically free non-busy blocks until the resident free bytes drop to
    /// the configured budget, largest blocks first.
    pub fn reclaim(&self) {
        let mut pools = self.pools.lock();
        for device_pools in pools.values_mut() {
            self.evict_over_budget(device_pools);
        }
    }

    fn evict_over_budget(&self, pools: &mut DevicePools) {
        let mut free_bytes = pools.free_bytes();
        if free_bytes <= self.config.free_pool_budget {
            return;
        }
        let mut evicted = 0usize;
        for pool in [&mut pools.large, &mut pools.small] {
            let mut i = pool.len();
            while i > 0 && free_bytes > self.config.free_pool_budget {
                i -= 1;
                if pool[i].busy {
                    continue;
                }
                let block = pool.remove(i);
                free_bytes -= block.byte_size;
                evicted += 1;
                self.runtime.free(block.ptr);
            }
        }
        if evicted > 0 {
            warn!(evicted, free_bytes, "evicted pooled device blocks over budget");
            counter!("kiln_gpu_pool_evicted_total").increment(evicted as u64);
        }
        gauge!("kiln_gpu_pool_resident_bytes").set(free_bytes as f64);
    }
}

impl DeviceAllocator for CachingGpuAllocator {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cuda
    }

    fn allocate(&self, byte_size: usize) -> Option<NonNull<u8>> {
        if byte_size == 0 {
            return None;
        }
        let rounded = round_up(byte_size, self.config.block_granularity);
        let device = self.runtime.current_device();

        let mut pools = self.pools.lock();
        let device_pools = pools.entry(device).or_default();
        let pool = if rounded >= self.config.large_block_threshold {
            &mut device_pools.large
        } else {
            &mut device_pools.small
        };

        // First fit over the size-sorted pool.
        if let Some(block) = pool.iter_mut().find(|b| !b.busy && b.byte_size >= rounded) {
            block.busy = true;
            device_pools.busy_count += 1;
            counter!("kiln_gpu_pool_hit_total").increment(1);
            return Some(block.ptr);
        }

        match self.runtime.malloc(rounded) {
            Some(ptr) => {
                insert_sorted(
                    pool,
                    MemoryBlock {
                        ptr,
                        byte_size: rounded,
                        busy: true,
                    },
                );
                device_pools.busy_count += 1;
                counter!("kiln_gpu_device_malloc_total").increment(1);
                Some(ptr)
            }
            None => {
                error!(byte_size, rounded, device, "device memory exhausted");
                None
            }
        }
    }

    fn release(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut pools = self.pools.lock();
        for device_pools in pools.values_mut() {
            let found = device_pools
                .large
                .iter_mut()
                .chain(device_pools.small.iter_mut())
                .find(|b| b.ptr.as_ptr() == ptr);
            if let Some(block) = found {
                block.busy = false;
                device_pools.busy_count -= 1;
                self.evict_over_budget(device_pools);
                return;
            }
        }
        warn!(?ptr, "release of a pointer unknown to the caching allocator");
    }

    fn memcpy(
        &self,
        src: *const u8,
        dst: *mut u8,
        byte_size: usize,
        kind: MemcpyKind,
        stream: Option<DeviceStream>,
        need_sync: bool,
    ) -> Result<()> {
        self.runtime.memcpy(src, dst, byte_size, kind, stream)?;
        if need_sync {
            self.runtime.synchronize(stream);
        }
        Ok(())
    }

    fn memset_zero(
        &self,
        ptr: *mut u8,
        byte_size: usize,
        stream: Option<DeviceStream>,
        need_sync: bool,
    ) -> Result<()> {
        self.runtime.memset(ptr, 0, byte_size, stream)?;
        if need_sync {
            self.runtime.synchronize(stream);
        }
        Ok(())
    }
}

impl Drop for CachingGpuAllocator {
    fn drop(&mut self) {
        // Teardown frees everything still resident. Any Buffer that owns a
        // block keeps this allocator alive through its Arc, so a busy block
        // here is a leak, not a live borrow.
        let mut pools = self.pools.lock();
        for device_pools in pools.values_mut() {
            for block in device_pools
                .large
                .drain(..)
                .chain(device_pools.small.drain(..))
            {
                if block.busy {
                    warn!(
                        byte_size = block.byte_size,
                        "freeing a still-busy block at teardown"
                    );
                }
                self.runtime.free(block.ptr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with_budget(budget: usize) -> (Arc<EmulatedGpuRuntime>, CachingGpuAllocator) {
        let runtime = Arc::new(EmulatedGpuRuntime::new(0));
        let config = CachingAllocatorConfig {
            free_pool_budget: budget,
            ..CachingAllocatorConfig::default()
        };
        (runtime.clone(), CachingGpuAllocator::new(runtime, config))
    }

    #[test]
    fn requests_are_rounded_to_granularity() {
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(513, 512), 1024);
    }

    #[test]
    fn released_block_is_reused_without_new_device_malloc() {
        let (runtime, alloc) = allocator_with_budget(usize::MAX);
        let first = alloc.allocate(4096).unwrap();
        alloc.release(first.as_ptr());
        let second = alloc.allocate(2048).unwrap();
        assert_eq!(first, second);
        assert_eq!(runtime.device_malloc_count(), 1);
    }

    #[test]
    fn size_classes_use_separate_pools() {
        let (runtime, alloc) = allocator_with_budget(usize::MAX);
        let small = alloc.allocate(4096).unwrap();
        alloc.release(small.as_ptr());
        // A large request must not be served from the pooled small block.
        let large = alloc.allocate(2 * 1024 * 1024).unwrap();
        assert_ne!(small, large);
        assert_eq!(runtime.device_malloc_count(), 2);
    }

    #[test]
    fn over_budget_release_evicts_physically() {
        let (runtime, alloc) = allocator_with_budget(1024);
        let a = alloc.allocate(4096).unwrap();
        let b = alloc.allocate(8192).unwrap();
        alloc.release(a.as_ptr());
        alloc.release(b.as_ptr());
        assert!(alloc.resident_free_bytes() <= 1024);
        assert!(runtime.device_free_count() >= 1);
    }

    #[test]
    fn busy_blocks_survive_reclaim() {
        let (runtime, alloc) = allocator_with_budget(0);
        let busy = alloc.allocate(4096).unwrap();
        alloc.reclaim();
        assert_eq!(runtime.device_free_count(), 0);
        assert_eq!(alloc.busy_blocks(), 1);
        alloc.release(busy.as_ptr());
    }
}
