//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


mod common;

use std::thread;
use std::time::Duration;

use common::{collect_blocks, local_matrix, run_ranks};
use xtx_core::comm::SimDeviceCollective;
use xtx_core::{
    DeviceCollective, DeviceRuntime, FaultPoint, GramError, HostCollective, LocalCommunicator, ReductionBackend,
    ReductionPath, SimDevice, TraceEvent, compute_distributed_gram_blocks,
};

fn single_comm() -> LocalCommunicator {
    LocalCommunicator::group(1).unwrap().pop().unwrap()
}

fn assert_released(device: &SimDevice) {
    assert_eq!(device.live_streams(), 0, "streams leaked");
    assert_eq!(device.live_events(), 0, "events leaked");
}

/// Count delivered blocks of a single-rank host-staged run on `device`.
fn run_counting(device: &SimDevice, n: usize, block_size: usize) -> (Result<usize, GramError>, usize) {
    let comm = single_comm();
    let m = 3;
    let x = device.alloc_from_host(&local_matrix(0, m, n)).unwrap();
    let mut handle = device.create_blas_handle().unwrap();
    let reduction = ReductionBackend::<SimDevice, f64>::HostStaged;
    let mut delivered = 0;
    let result = compute_distributed_gram_blocks(
        device,
        &x,
        m,
        n,
        block_size,
        &mut handle,
        &comm,
        &reduction,
        |_| {
            delivered += 1;
            Ok(())
        },
    )
    .map(|summary| summary.blocks);
    (result, delivered)
}

#[test]
fn gemm_target_is_the_copied_buffer() {
    let device = SimDevice::builder()
        .compute_latency(Duration::from_millis(5))
        .copy_latency(Duration::from_millis(2))
        .build();
    let (result, delivered) = run_counting(&device, 12, 2);
    assert_eq!(result.unwrap(), 6);
    assert_eq!(delivered, 6);

    let trace = device.trace();
    let gemms: Vec<(usize, usize)> = trace
        .iter()
        .enumerate()
        .filter_map(|(pos, e)| match e {
            TraceEvent::Gemm { target, .. } => Some((pos, *target)),
            _ => None,
        })
        .collect();
    let copies: Vec<(usize, usize)> = trace
        .iter()
        .enumerate()
        .filter_map(|(pos, e)| match e {
            TraceEvent::CopyToHost { source, .. } => Some((pos, *source)),
            _ => None,
        })
        .collect();
    assert_eq!(gemms.len(), 6);
    assert_eq!(copies.len(), 6);

    for k in 0..6 {
        // block k is copied out of the buffer its GEMM wrote
        assert_eq!(gemms[k].1, copies[k].1, "block {}", k);
        if k + 1 < 6 {
            // consecutive blocks alternate between the two slots
            assert_ne!(gemms[k].1, gemms[k + 1].1);
            // block k+1 is issued before block k is copied
            assert!(gemms[k + 1].0 < copies[k].0);
        }
    }
}

#[test]
fn gemms_run_on_the_compute_stream_and_copies_elsewhere() {
    let device = SimDevice::new();
    let (result, _) = run_counting(&device, 8, 4);
    assert!(result.is_ok());
    let trace = device.trace();
    let gemm_streams: Vec<_> = trace
        .iter()
        .filter_map(|e| match e {
            TraceEvent::Gemm { stream, .. } => Some(*stream),
            _ => None,
        })
        .collect();
    let copy_streams: Vec<_> = trace
        .iter()
        .filter_map(|e| match e {
            TraceEvent::CopyToHost { stream, .. } => Some(*stream),
            _ => None,
        })
        .collect();
    assert_eq!(gemm_streams.len(), 2);
    let compute = gemm_streams[0].expect("GEMM must be bound to a stream");
    assert!(gemm_streams.iter().all(|s| *s == Some(compute)));
    assert!(copy_streams.iter().all(|s| *s != compute));
    assert_released(&device);
}

#[test]
fn non_divisible_block_size_issues_no_device_work() {
    let device = SimDevice::new();
    let (result, delivered) = run_counting(&device, 10, 4);
    assert!(matches!(result, Err(GramError::Precondition(_))));
    assert_eq!(delivered, 0);
    assert!(device.trace().is_empty());

    let (result, _) = run_counting(&device, 10, 0);
    assert!(matches!(result, Err(GramError::Precondition(_))));
    assert!(device.trace().is_empty());
}

#[test]
fn short_local_matrix_is_a_precondition_error() {
    let device = SimDevice::new();
    let comm = single_comm();
    let x = device.alloc(10, 1.0f64).unwrap();
    let mut handle = device.create_blas_handle().unwrap();
    let result = compute_distributed_gram_blocks(
        &device,
        &x,
        3,
        4,
        2,
        &mut handle,
        &comm,
        &ReductionBackend::<SimDevice, f64>::HostStaged,
        |_| Ok(()),
    );
    assert!(matches!(result, Err(GramError::Precondition(_))));
    assert!(device.trace().is_empty());
}

#[test]
fn event_creation_failure_releases_everything() {
    let device = SimDevice::builder()
        .fail_at(FaultPoint::CreateEvent, 0)
        .build();
    let (result, delivered) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceResource(_))));
    assert_eq!(delivered, 0);
    assert_released(&device);
}

#[test]
fn stream_creation_failure_is_a_resource_error() {
    let device = SimDevice::builder()
        .fail_at(FaultPoint::CreateStream, 1)
        .build();
    let (result, _) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceResource(_))));
    assert_released(&device);
}

#[test]
fn failed_gemm_execution_aborts_at_its_compute_event() {
    let device = SimDevice::builder()
        .fail_at(FaultPoint::GemmExecution, 1)
        .build();
    let (result, delivered) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceOperation(_))));
    // block 0 completes, block 1's product is never delivered
    assert_eq!(delivered, 1);
    assert_released(&device);
}

#[test]
fn failed_compute_sync_aborts_instead_of_skipping_the_swap() {
    // waits in order: compute 0, copy 0, compute 1
    let device = SimDevice::builder()
        .fail_at(FaultPoint::SynchronizeEvent, 2)
        .build();
    let (result, delivered) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceOperation(_))));
    assert_eq!(delivered, 1);
    assert_released(&device);
}

#[test]
fn failed_copy_launch_is_an_operation_error() {
    let device = SimDevice::builder()
        .fail_at(FaultPoint::CopyLaunch, 2)
        .build();
    let (result, delivered) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceOperation(_))));
    assert_eq!(delivered, 2);
    assert_released(&device);
}

#[test]
fn failed_gemm_launch_delivers_nothing() {
    let device = SimDevice::builder()
        .fail_at(FaultPoint::GemmLaunch, 0)
        .build();
    let (result, delivered) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::DeviceOperation(_))));
    assert_eq!(delivered, 0);
    assert_released(&device);
}

#[test]
fn allocation_failure_is_reported() {
    // x is allocation 0; the pinned staging buffer is allocation 1
    let device = SimDevice::builder().fail_at(FaultPoint::Alloc, 1).build();
    let (result, _) = run_counting(&device, 8, 2);
    assert!(matches!(result, Err(GramError::MemoryAllocation(_))));
    assert_released(&device);
}

#[test]
fn consumer_error_aborts_and_releases() {
    let device = SimDevice::new();
    let comm = single_comm();
    let x = device.alloc_from_host(&local_matrix(0, 2, 8)).unwrap();
    let mut handle = device.create_blas_handle().unwrap();
    let mut seen = Vec::new();
    let result = compute_distributed_gram_blocks(
        &device,
        &x,
        2,
        8,
        2,
        &mut handle,
        &comm,
        &ReductionBackend::<SimDevice, f64>::HostStaged,
        |block| {
            seen.push(block.offset());
            if block.offset() == 2 {
                return Err(GramError::Precondition("downstream full".to_string()));
            }
            Ok(())
        },
    );
    assert_eq!(result, Err(GramError::Precondition("downstream full".to_string())));
    assert_eq!(seen, vec![0, 2]);
    assert_released(&device);
    assert!(handle.bound_stream().is_none());
}

struct RefusingCollective;

impl DeviceCollective<SimDevice, f64> for RefusingCollective {
    fn all_reduce_sum_in_place(
        &self,
        _runtime: &SimDevice,
        _buffer: &<SimDevice as DeviceRuntime>::Buffer<f64>,
        _count: usize,
        _stream: &<SimDevice as DeviceRuntime>::Stream,
    ) -> xtx_core::Result<()> {
        Err(GramError::Collective("transport unavailable".to_string()))
    }
}

#[test]
fn device_collective_failure_is_a_collective_error() {
    let device = SimDevice::new();
    let comm = single_comm();
    let x = device.alloc_from_host(&local_matrix(0, 2, 4)).unwrap();
    let mut handle = device.create_blas_handle().unwrap();
    let refusing = RefusingCollective;
    let reduction = ReductionBackend::DeviceDirect(&refusing as &dyn DeviceCollective<SimDevice, f64>);
    let result = compute_distributed_gram_blocks(&device, &x, 2, 4, 2, &mut handle, &comm, &reduction, |_| {
        Ok(())
    });
    assert!(matches!(result, Err(GramError::Collective(_))));
    assert_released(&device);
}

#[test]
fn departed_peer_fails_host_staged_reduction() {
    let mut members = LocalCommunicator::group(2).unwrap();
    let survivor = members.remove(0);
    drop(members);

    let device = SimDevice::new();
    let result = collect_blocks(
        &device,
        &survivor,
        &local_matrix(0, 2, 4),
        2,
        4,
        2,
        ReductionPath::HostStaged,
    );
    assert!(matches!(result, Err(GramError::Collective(_))));
    assert_released(&device);
}

#[test]
fn device_direct_reduction_fails_on_its_stream_when_a_peer_leaves() {
    let mut members = LocalCommunicator::group(2).unwrap();
    let peer = members.pop().unwrap();
    let survivor = members.pop().unwrap();

    // both ranks join the device communicator, then rank 1 leaves
    let departed = thread::spawn(move || {
        let collective = SimDeviceCollective::init(&peer).unwrap();
        drop(collective);
    });
    let collective = SimDeviceCollective::init(&survivor).unwrap();
    departed.join().unwrap();

    let device = SimDevice::new();
    let x = device.alloc_from_host(&local_matrix(0, 2, 8)).unwrap();
    let mut handle = device.create_blas_handle().unwrap();
    let reduction = ReductionBackend::DeviceDirect(&collective as &dyn DeviceCollective<SimDevice, f64>);
    let mut delivered = 0;
    let result = compute_distributed_gram_blocks(
        &device,
        &x,
        2,
        8,
        2,
        &mut handle,
        &survivor,
        &reduction,
        |_| {
            delivered += 1;
            Ok(())
        },
    );

    assert!(matches!(result, Err(GramError::Collective(_))), "{:?}", result);
    assert_eq!(delivered, 0);
    assert_released(&device);
    assert!(handle.bound_stream().is_none());
}

#[test]
fn every_rank_releases_resources_after_success() {
    let released = run_ranks(3, |comm| {
        let device = SimDevice::builder()
            .compute_latency(Duration::from_millis(1))
            .build();
        let x = local_matrix(comm.rank(), 4, 6);
        collect_blocks(&device, &comm, &x, 4, 6, 2, ReductionPath::DeviceDirect).unwrap();
        (device.live_streams(), device.live_events())
    });
    assert!(released.iter().all(|&(s, e)| s == 0 && e == 0));
}
