//! Tensor metadata invariants, reshape/clone semantics, and device
//! migration round trips.

use std::ptr::NonNull;
use std::sync::Arc;

use kiln_core::{
    Buffer, DataType, DeviceAllocator, DeviceAllocatorFactory, DeviceType, MemoryRuntime,
    StatusCode, Tensor,
};

fn cpu() -> Arc<dyn DeviceAllocator> {
    DeviceAllocatorFactory::cpu()
}

#[test]
fn size_and_byte_size_invariants_hold_across_reshape() {
    let mut tensor = Tensor::alloc(DataType::Fp32, [4, 5], &cpu()).unwrap();
    assert_eq!(tensor.size(), 20);
    assert_eq!(tensor.byte_size(), 80);

    tensor.reshape(&[2, 2, 5]).unwrap();
    assert_eq!(tensor.size(), 20);
    assert_eq!(tensor.byte_size(), 80);
    assert_eq!(tensor.dims(), &[2, 2, 5]);

    tensor.reshape(&[8, 5]).unwrap();
    assert_eq!(tensor.size(), 40);
    assert_eq!(tensor.byte_size(), 40 * 4);
    assert_eq!(tensor.size(), tensor.dims().iter().product::<usize>());
}

#[test]
fn reshape_to_current_dims_keeps_the_buffer() {
    let mut tensor = Tensor::alloc(DataType::Int32, [3, 7], &cpu()).unwrap();
    let before = tensor.get_buffer().unwrap().ptr();
    tensor.reshape(&[3, 7]).unwrap();
    assert_eq!(tensor.get_buffer().unwrap().ptr(), before);

    // Shrinking reuses the buffer too.
    tensor.reshape(&[7]).unwrap();
    assert_eq!(tensor.get_buffer().unwrap().ptr(), before);
}

#[test]
fn growth_round_trip_preserves_overlapping_bytes() {
    let mut tensor = Tensor::alloc(DataType::Fp32, [4], &cpu()).unwrap();
    for i in 0..4 {
        *tensor.index_mut::<f32>(i) = (i + 1) as f32;
    }

    tensor.reshape(&[8]).unwrap();
    for i in 0..4 {
        assert_eq!(*tensor.index::<f32>(i), (i + 1) as f32);
    }
    for i in 4..8 {
        *tensor.index_mut::<f32>(i) = (10 * i) as f32;
    }

    tensor.reshape(&[4]).unwrap();
    tensor.reshape(&[8]).unwrap();
    for i in 0..4 {
        assert_eq!(*tensor.index::<f32>(i), (i + 1) as f32);
    }
    for i in 4..8 {
        assert_eq!(*tensor.index::<f32>(i), (10 * i) as f32);
    }
}

#[test]
fn shallow_clone_shares_the_buffer() {
    let mut tensor = Tensor::alloc(DataType::Fp32, [6], &cpu()).unwrap();
    let view = tensor.clone();
    assert!(Arc::ptr_eq(
        tensor.get_buffer().unwrap(),
        view.get_buffer().unwrap()
    ));

    *tensor.index_mut::<f32>(2) = 9.5;
    assert_eq!(*view.index::<f32>(2), 9.5);
}

#[test]
fn deep_clone_is_independent_both_ways() {
    let mut tensor = Tensor::alloc(DataType::Int32, [5], &cpu()).unwrap();
    for i in 0..5 {
        *tensor.index_mut::<i32>(i) = i as i32;
    }

    let mut copy = tensor.deep_clone().unwrap();
    assert!(!Arc::ptr_eq(
        tensor.get_buffer().unwrap(),
        copy.get_buffer().unwrap()
    ));

    *copy.index_mut::<i32>(0) = 100;
    assert_eq!(*tensor.index::<i32>(0), 0);
    *tensor.index_mut::<i32>(1) = -7;
    assert_eq!(*copy.index::<i32>(1), 1);
}

#[test]
fn device_migration_round_trip_is_bit_exact() {
    let mut tensor = Tensor::alloc(DataType::Fp32, [3, 4], &cpu()).unwrap();
    for i in 0..12 {
        *tensor.index_mut::<f32>(i) = (i as f32) * 0.25 - 1.0;
    }

    tensor.to_cuda(None).unwrap();
    assert_eq!(tensor.device_type(), DeviceType::Cuda);

    // Already on the target device: no-op.
    tensor.to_cuda(None).unwrap();

    tensor.to_cpu().unwrap();
    assert_eq!(tensor.device_type(), DeviceType::Cpu);
    for i in 0..12 {
        assert_eq!(*tensor.index::<f32>(i), (i as f32) * 0.25 - 1.0);
    }
}

#[test]
fn strides_are_row_major() {
    let tensor = Tensor::new(DataType::Fp32, [4, 5, 2, 6]);
    assert_eq!(tensor.strides(), vec![60, 12, 6, 1]);

    let vector = Tensor::new_1d(DataType::Int8, 9);
    assert_eq!(vector.strides(), vec![1]);
}

#[test]
fn unbound_tensor_reports_unknown_device_and_null_pointer() {
    let tensor = Tensor::new_2d(DataType::Fp32, 2, 3);
    assert_eq!(tensor.device_type(), DeviceType::Unknown);
    assert!(tensor.ptr::<f32>().is_none());
    assert!(tensor.as_slice::<f32>().is_none());
    assert!(tensor.is_empty());
}

#[test]
fn allocate_skips_when_buffer_is_large_enough() {
    let allocator = cpu();
    let mut tensor = Tensor::alloc(DataType::Fp32, [16], &allocator).unwrap();
    let before = tensor.get_buffer().unwrap().ptr();

    tensor.allocate(&allocator, false).unwrap();
    assert_eq!(tensor.get_buffer().unwrap().ptr(), before);

    tensor.allocate(&allocator, true).unwrap();
    assert_ne!(tensor.get_buffer().unwrap().ptr(), before);
}

#[test]
fn allocate_with_unknown_dtype_fails() {
    let err = Tensor::alloc(DataType::Unknown, [4], &cpu()).unwrap_err();
    assert_eq!(err, StatusCode::InvalidArgument);
}

#[test]
fn assign_rejects_undersized_buffers() {
    let mut tensor = Tensor::alloc(DataType::Fp32, [8], &cpu()).unwrap();
    let small = Arc::new(Buffer::alloc(8, cpu()).unwrap());
    let err = tensor.assign(small).unwrap_err();
    assert_eq!(err, StatusCode::InvalidArgument);
}

#[test]
fn assign_rejects_cross_device_rebinds_unless_explicit() {
    let runtime = MemoryRuntime::default();
    let mut tensor = Tensor::alloc(DataType::Fp32, [8], &runtime.allocator(DeviceType::Cpu)).unwrap();

    let gpu_buffer = Arc::new(Buffer::alloc(32, runtime.allocator(DeviceType::Cuda)).unwrap());
    let err = tensor.assign(gpu_buffer.clone()).unwrap_err();
    assert_eq!(err, StatusCode::DeviceMismatch);

    tensor.assign_across_devices(gpu_buffer).unwrap();
    assert_eq!(tensor.device_type(), DeviceType::Cuda);
}

#[test]
fn external_tensor_views_caller_memory_without_taking_it() {
    let mut backing: Vec<f32> = (0..10).map(|i| i as f32).collect();
    let ptr = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();

    {
        let tensor =
            Tensor::from_external(DataType::Fp32, [2, 5], ptr, DeviceType::Cpu).unwrap();
        assert_eq!(tensor.as_slice::<f32>().unwrap(), backing.as_slice());
        assert!(tensor.get_buffer().unwrap().is_external());
    }

    // Dropping the view leaves the caller's memory untouched.
    assert_eq!(backing[9], 9.0);
}

#[test]
#[should_panic(expected = "out of range")]
fn out_of_range_index_aborts() {
    let tensor = Tensor::alloc(DataType::Fp32, [4], &cpu()).unwrap();
    let _ = tensor.index::<f32>(4);
}

#[test]
#[should_panic(expected = "does not match the tensor dtype")]
fn mismatched_element_type_aborts() {
    let tensor = Tensor::alloc(DataType::Fp32, [4], &cpu()).unwrap();
    let _ = tensor.index::<i32>(0);
}

#[test]
fn memory_runtime_wires_one_allocator_per_device() {
    let runtime = MemoryRuntime::default();
    assert_eq!(runtime.allocator(DeviceType::Cpu).device_type(), DeviceType::Cpu);
    assert_eq!(runtime.allocator(DeviceType::Cuda).device_type(), DeviceType::Cuda);
}
