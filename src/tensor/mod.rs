// Copyright 2025-2026 KILN-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Shape/stride/dtype views over shared device buffers.
//!
//! A `Tensor` is metadata plus an `Arc<Buffer>`. Cloning a tensor is shallow:
//! both views share the same bytes until the last holder drops, at which
//! point the buffer releases its block. [`Tensor::deep_clone`] is the
//! explicit deep copy. A single logical owner performs mutating operations
//! (reshape, allocate, assign); other holders may read concurrently, and
//! concurrent mutation must be serialized by the caller.

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, error};

use crate::memory::{
    Buffer, DeviceAllocator, DeviceAllocatorFactory, DeviceStream, DeviceType, MemcpyKind,
};
use crate::status::{Result, Status};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    #[default]
    Unknown,
    Fp32,
    Int8,
    Int32,
}

impl DataType {
    /// Byte width of one element. 0 signals an unsupported dtype and turns
    /// every byte-size computation into a reported failure downstream.
    pub fn size(&self) -> usize {
        match self {
            DataType::Fp32 => 4,
            DataType::Int8 => 1,
            DataType::Int32 => 4,
            DataType::Unknown => 0,
        }
    }
}

/// Rust types that can back a tensor element.
pub trait Element: Copy + Default + 'static {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Fp32;
}

impl Element for i8 {
    const DATA_TYPE: DataType = DataType::Int8;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::Int32;
}

fn element_count(dims: &[usize]) -> usize {
    if dims.is_empty() {
        0
    } else {
        dims.iter().product()
    }
}

/// Shape + dtype metadata bound to a shared [`Buffer`].
#[derive(Clone, Default)]
pub struct Tensor {
    size: usize,
    dims: Vec<usize>,
    data_type: DataType,
    buffer: Option<Arc<Buffer>>,
}

impl Tensor {
    /// Unbound tensor: dimensions recorded, no storage yet.
    pub fn new(data_type: DataType, dims: impl Into<Vec<usize>>) -> Self {
        let dims = dims.into();
        let size = element_count(&dims);
        Self {
            size,
            dims,
            data_type,
            buffer: None,
        }
    }

    pub fn new_1d(data_type: DataType, dim0: usize) -> Self {
        Self::new(data_type, [dim0])
    }

    pub fn new_2d(data_type: DataType, dim0: usize, dim1: usize) -> Self {
        Self::new(data_type, [dim0, dim1])
    }

    pub fn new_3d(data_type: DataType, dim0: usize, dim1: usize, dim2: usize) -> Self {
        Self::new(data_type, [dim0, dim1, dim2])
    }

    pub fn new_4d(data_type: DataType, dim0: usize, dim1: usize, dim2: usize, dim3: usize) -> Self {
        Self::new(data_type, [dim0, dim1, dim2, dim3])
    }

    /// Tensor bound immediately to an owned buffer from `allocator`.
    pub fn alloc(
        data_type: DataType,
        dims: impl Into<Vec<usize>>,
        allocator: &Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let mut tensor = Self::new(data_type, dims);
        tensor.allocate(allocator, true)?;
        Ok(tensor)
    }

    /// View over externally owned memory; the buffer never releases it.
    pub fn from_external(
        data_type: DataType,
        dims: impl Into<Vec<usize>>,
        ptr: NonNull<u8>,
        device_type: DeviceType,
    ) -> Result<Self> {
        let mut tensor = Self::new(data_type, dims);
        let byte_size = tensor.byte_size();
        if byte_size == 0 {
            return Err(Status::invalid_argument(
                "external tensor has zero byte size (empty dims or unknown dtype)",
            ));
        }
        tensor.buffer = Some(Arc::new(Buffer::external(byte_size, ptr, device_type)));
        Ok(tensor)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn byte_size(&self) -> usize {
        self.size * self.data_type.size()
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// # Panics
    ///
    /// `idx` must be within the tensor's rank.
    pub fn get_dim(&self, idx: usize) -> usize {
        assert!(
            idx < self.dims.len(),
            "dimension index {idx} out of range for rank {}",
            self.dims.len()
        );
        self.dims[idx]
    }

    /// Device kind of the bound buffer; `Unknown` while unbound.
    pub fn device_type(&self) -> DeviceType {
        match &self.buffer {
            Some(buffer) => buffer.device_type(),
            None => DeviceType::Unknown,
        }
    }

    pub fn get_buffer(&self) -> Option<&Arc<Buffer>> {
        self.buffer.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
            || match &self.buffer {
                Some(buffer) => buffer.ptr().is_null(),
                None => true,
            }
    }

    /// Bind (or rebind) a buffer sized to the tensor's current byte size.
    /// An adequately sized buffer already bound is kept unless `need_realloc`
    /// forces a rebuild.
    pub fn allocate(
        &mut self,
        allocator: &Arc<dyn DeviceAllocator>,
        need_realloc: bool,
    ) -> Result<()> {
        let byte_size = self.byte_size();
        if byte_size == 0 {
            error!("tensor byte size is zero (empty dims or unknown dtype)");
            return Err(Status::invalid_argument(
                "cannot allocate a tensor with zero byte size",
            ));
        }
        if let Some(buffer) = &self.buffer {
            if byte_size <= buffer.byte_size() && !need_realloc {
                return Ok(());
            }
        }
        self.buffer = Some(Arc::new(Buffer::alloc(byte_size, allocator.clone())?));
        Ok(())
    }

    /// Change the logical dimensions.
    ///
    /// A new buffer is allocated (and old bytes copied over) only when the
    /// new element count needs more bytes than the bound buffer holds;
    /// shrinking or equal-size reshape reuses the buffer unchanged. An
    /// unbound tensor just updates metadata.
    pub fn reshape(&mut self, dims: &[usize]) -> Result<()> {
        let size = element_count(dims);
        let Some(buffer) = &self.buffer else {
            self.dims = dims.to_vec();
            self.size = size;
            return Ok(());
        };

        let needed = size * self.data_type.size();
        if needed > buffer.byte_size() {
            let Some(allocator) = buffer.allocator() else {
                return Err(Status::allocate_failed(
                    "cannot grow a tensor backed by external memory",
                ));
            };
            let new_buffer = Buffer::alloc(needed, allocator)?;
            new_buffer.copy_from(buffer)?;
            self.buffer = Some(Arc::new(new_buffer));
        }
        self.dims = dims.to_vec();
        self.size = size;
        Ok(())
    }

    /// Deep copy: a new tensor with an independent buffer of identical size
    /// on the same allocator, bytes copied from this one.
    pub fn deep_clone(&self) -> Result<Tensor> {
        let mut out = self.clone();
        if let Some(buffer) = &self.buffer {
            let Some(allocator) = buffer.allocator() else {
                return Err(Status::allocate_failed(
                    "cannot deep-clone a tensor backed by external memory",
                ));
            };
            let new_buffer = Buffer::alloc(self.byte_size(), allocator)?;
            new_buffer.copy_from(buffer)?;
            out.buffer = Some(Arc::new(new_buffer));
        }
        Ok(out)
    }

    /// Migrate to the device served by `allocator`. No-op when already
    /// there; otherwise allocates a target buffer, copies across with the
    /// matching transfer kind, and swaps the binding.
    pub fn to_device(
        &mut self,
        allocator: &Arc<dyn DeviceAllocator>,
        stream: Option<DeviceStream>,
    ) -> Result<()> {
        let Some(buffer) = self.buffer.clone() else {
            return Err(Status::invalid_argument("tensor has no buffer bound"));
        };
        let src_device = buffer.device_type();
        let dst_device = allocator.device_type();
        if src_device == DeviceType::Unknown || dst_device == DeviceType::Unknown {
            return Err(Status::device_mismatch(
                "migration endpoints must both have a known device type",
            ));
        }
        if src_device == dst_device {
            debug!(device = %dst_device, "tensor is already on the target device");
            return Ok(());
        }

        let byte_size = self.byte_size();
        let new_buffer = Buffer::alloc(byte_size, allocator.clone())?;
        let kind = match (src_device, dst_device) {
            (DeviceType::Cpu, DeviceType::Cuda) => MemcpyKind::HostToDevice,
            (DeviceType::Cuda, DeviceType::Cpu) => MemcpyKind::DeviceToHost,
            (DeviceType::Cuda, DeviceType::Cuda) => MemcpyKind::DeviceToDevice,
            _ => MemcpyKind::HostToHost,
        };
        // Any copy touching the device goes through a device-capable
        // allocator; prefer ones the caller handed us over the factory.
        let copier: Arc<dyn DeviceAllocator> = match kind {
            MemcpyKind::HostToHost => allocator.clone(),
            _ if dst_device == DeviceType::Cuda => allocator.clone(),
            _ => buffer
                .allocator()
                .unwrap_or_else(|| DeviceAllocatorFactory::cuda()),
        };
        copier.memcpy(buffer.ptr(), new_buffer.ptr_mut(), byte_size, kind, stream, false)?;
        self.buffer = Some(Arc::new(new_buffer));
        Ok(())
    }

    pub fn to_cpu(&mut self) -> Result<()> {
        let cpu: Arc<dyn DeviceAllocator> = DeviceAllocatorFactory::cpu();
        self.to_device(&cpu, None)
    }

    pub fn to_cuda(&mut self, stream: Option<DeviceStream>) -> Result<()> {
        let cuda: Arc<dyn DeviceAllocator> = DeviceAllocatorFactory::cuda();
        self.to_device(&cuda, stream)
    }

    /// Rebind to an externally constructed buffer on the same device.
    ///
    /// Fails when the buffer is smaller than the tensor needs, or when its
    /// device kind differs from the current binding; cross-device rebinds
    /// must go through [`Tensor::assign_across_devices`].
    pub fn assign(&mut self, buffer: Arc<Buffer>) -> Result<()> {
        if let Some(current) = &self.buffer {
            if current.device_type() != buffer.device_type() {
                return Err(Status::device_mismatch(format!(
                    "rebinding a {} tensor to a {} buffer",
                    current.device_type(),
                    buffer.device_type()
                )));
            }
        }
        self.assign_across_devices(buffer)
    }

    /// Rebind to `buffer` regardless of its device kind. Size is still
    /// checked.
    pub fn assign_across_devices(&mut self, buffer: Arc<Buffer>) -> Result<()> {
        let byte_size = self.byte_size();
        if byte_size > buffer.byte_size() {
            error!(
                needed = byte_size,
                available = buffer.byte_size(),
                "buffer too small for the tensor"
            );
            return Err(Status::invalid_argument(
                "assigned buffer is smaller than the tensor's byte size",
            ));
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Row-major strides: `stride[i] = product(dims[i+1..])`, last stride 1.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = Vec::with_capacity(self.dims.len());
        if self.dims.is_empty() {
            return strides;
        }
        for i in 0..self.dims.len() - 1 {
            strides.push(self.dims[i + 1..].iter().product());
        }
        strides.push(1);
        strides
    }

    /// Pointer to the first element; `None` while unbound.
    pub fn ptr<T: Element>(&self) -> Option<*const T> {
        self.check_element::<T>();
        let buffer = self.buffer.as_ref()?;
        if buffer.ptr().is_null() {
            return None;
        }
        Some(buffer.ptr() as *const T)
    }

    pub fn ptr_mut<T: Element>(&mut self) -> Option<*mut T> {
        self.check_element::<T>();
        let buffer = self.buffer.as_ref()?;
        if buffer.ptr().is_null() {
            return None;
        }
        Some(buffer.ptr_mut() as *mut T)
    }

    /// Pointer to the element at `offset`.
    ///
    /// # Panics
    ///
    /// The tensor must be bound and `offset` within `size()`.
    pub fn ptr_at<T: Element>(&self, offset: usize) -> *const T {
        self.check_access::<T>(offset);
        let buffer = self.buffer.as_ref().unwrap();
        // SAFETY: offset is within the bound buffer's element range.
        unsafe { (buffer.ptr() as *const T).add(offset) }
    }

    pub fn ptr_at_mut<T: Element>(&mut self, offset: usize) -> *mut T {
        self.check_access::<T>(offset);
        let buffer = self.buffer.as_ref().unwrap();
        // SAFETY: offset is within the bound buffer's element range.
        unsafe { (buffer.ptr_mut() as *mut T).add(offset) }
    }

    /// Element reference at `offset`.
    ///
    /// # Panics
    ///
    /// The tensor must be bound, `T` must match the dtype, and `offset`
    /// must be within `size()`.
    pub fn index<T: Element>(&self, offset: usize) -> &T {
        // SAFETY: check_access guarantees a live, in-range element.
        unsafe { &*self.ptr_at::<T>(offset) }
    }

    pub fn index_mut<T: Element>(&mut self, offset: usize) -> &mut T {
        // SAFETY: check_access guarantees a live, in-range element; writers
        // are serialized by the caller.
        unsafe { &mut *self.ptr_at_mut::<T>(offset) }
    }

    /// Whole-tensor slice view; `None` while unbound.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        let ptr = self.ptr::<T>()?;
        // SAFETY: the bound buffer holds at least size elements of T.
        Some(unsafe { std::slice::from_raw_parts(ptr, self.size) })
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Option<&mut [T]> {
        let size = self.size;
        let ptr = self.ptr_mut::<T>()?;
        // SAFETY: the bound buffer holds at least size elements of T;
        // writers are serialized by the caller.
        Some(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }

    fn check_element<T: Element>(&self) {
        assert_eq!(
            T::DATA_TYPE,
            self.data_type,
            "element type does not match the tensor dtype"
        );
    }

    fn check_access<T: Element>(&self, offset: usize) {
        self.check_element::<T>();
        assert!(
            offset < self.size,
            "tensor offset {offset} out of range for size {}",
            self.size
        );
        let buffer = self.buffer.as_ref().expect("tensor buffer is unbound");
        assert!(!buffer.ptr().is_null(), "tensor buffer holds a null pointer");
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("data_type", &self.data_type)
            .field("device_type", &self.device_type())
            .field("bound", &self.buffer.is_some())
            .finish()
    }
}
