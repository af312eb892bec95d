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


//! Benchmark harness: allreduce baseline, then the XtX block pipeline.
//!
//! Each rank runs on its own thread with its own device. No arguments; problem
//! sizes come from the `XTX_BENCH_*` env overrides and timings are printed by
//! rank 0 only.

use std::process::ExitCode;
use std::thread;

use xtx_core::benchmark::{
    AllreduceBaselineConfig, XtxBenchmarkConfig, run_allreduce_baseline, run_xtx_benchmark,
};
use xtx_core::{
    BackendCapabilities, DeviceAwareCollective, DeviceCollective, DeviceRuntime, GramError,
    HostCollective, LocalCommunicator, PipelineConfig, ReductionBackend, Result,
};

const DEFAULT_RANKS: usize = 2;

/// The simulated device shares the host address space, so message passing on
/// its buffers needs no staging.
#[cfg(any(not(feature = "cuda"), test))]
const SIM_CAPABILITIES: BackendCapabilities = BackendCapabilities {
    device_collective: true,
    device_aware_message_passing: true,
};

/// NCCL only: there is no device-aware message-passing transport for CUDA buffers.
#[cfg(any(feature = "cuda", test))]
const CUDA_CAPABILITIES: BackendCapabilities = BackendCapabilities {
    device_collective: true,
    device_aware_message_passing: false,
};

fn main() -> ExitCode {
    let _ = env_logger::Builder::from_default_env().try_init();

    let nprocs = std::env::var("XTX_BENCH_RANKS")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_RANKS);

    match run(nprocs) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("xtx-bench failed ({}): {}", e.kind(), e);
            eprintln!("xtx-bench failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(nprocs: usize) -> Result<()> {
    let members = LocalCommunicator::group(nprocs)?;
    let mut handles = Vec::with_capacity(members.len());
    for comm in members {
        let rank = comm.rank();
        let handle = thread::Builder::new()
            .name(format!("xtx-rank-{}", rank))
            .spawn(move || run_rank(comm))
            .map_err(|e| GramError::DeviceResource(format!("Failed to spawn rank {}: {}", rank, e)))?;
        handles.push((rank, handle));
    }

    let mut first_error = None;
    for (rank, handle) in handles {
        let outcome = handle
            .join()
            .unwrap_or_else(|_| Err(GramError::DeviceOperation(format!("Rank {} panicked", rank))));
        if let Err(e) = outcome {
            log::error!("Rank {} failed ({}): {}", rank, e.kind(), e);
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// One device per rank; NCCL cannot place two ranks of a communicator on one device.
#[cfg(any(feature = "cuda", test))]
fn device_ordinal(rank: usize, nprocs: usize, devices: usize) -> Result<usize> {
    if nprocs > devices {
        return Err(GramError::DeviceResource(format!(
            "{} ranks requested but only {} CUDA device(s) visible; set XTX_BENCH_RANKS to at most {}",
            nprocs, devices, devices
        )));
    }
    Ok(rank)
}

#[cfg(not(feature = "cuda"))]
fn run_rank(comm: LocalCommunicator) -> Result<()> {
    use xtx_core::SimDevice;
    use xtx_core::comm::SimDeviceCollective;

    let runtime = SimDevice::new();
    let collective = SimDeviceCollective::init(&comm)?;
    bench_rank(
        &runtime,
        &comm,
        &collective,
        Some(&comm),
        SIM_CAPABILITIES,
        AllreduceBaselineConfig::default().from_env(),
        XtxBenchmarkConfig::default().from_env(),
    )
}

#[cfg(feature = "cuda")]
fn run_rank(comm: LocalCommunicator) -> Result<()> {
    use xtx_core::comm::nccl::NcclCollective;
    use xtx_core::device::cuda::{CudaRuntime, device_count};

    let ordinal = device_ordinal(comm.rank(), comm.size(), device_count()?)?;
    let runtime = CudaRuntime::new(ordinal)?;
    let collective = NcclCollective::init(&comm)?;
    bench_rank(
        &runtime,
        &comm,
        &collective,
        None,
        CUDA_CAPABILITIES,
        AllreduceBaselineConfig::production().from_env(),
        XtxBenchmarkConfig::production().from_env(),
    )
}

fn bench_rank<R: DeviceRuntime>(
    runtime: &R,
    comm: &LocalCommunicator,
    collective: &dyn DeviceCollective<R, f64>,
    device_aware: Option<&dyn DeviceAwareCollective<R, f64>>,
    capabilities: BackendCapabilities,
    baseline: AllreduceBaselineConfig,
    xtx: XtxBenchmarkConfig,
) -> Result<()> {
    let rank0 = comm.rank() == 0;

    let device_collective = capabilities.device_collective.then_some(collective);
    let device_aware = device_aware.filter(|_| capabilities.device_aware_message_passing);
    let report = run_allreduce_baseline(runtime, comm, device_collective, device_aware, &baseline)?;
    if rank0 {
        if let Some(seconds) = report.device_direct_seconds {
            println!(
                "Time in seconds for device-direct allreduce using the collective library: {:.18e}",
                seconds
            );
        }
        if let Some(seconds) = report.device_aware_seconds {
            println!(
                "Time in seconds for device-direct allreduce using device-aware message passing: {:.18e}",
                seconds
            );
        }
    }

    if rank0 {
        println!("nprocs: {}", comm.size());
        println!("localNumDofs: {}", xtx.local_num_dofs(comm.size()));
        println!("numberVectors: {}", xtx.number_vectors);
    }
    let pipeline = PipelineConfig::from_env();
    let reduction = ReductionBackend::resolve(capabilities, Some(collective), &pipeline)?;
    let report = run_xtx_benchmark(runtime, comm, &reduction, &xtx, &pipeline)?;
    if rank0 {
        println!("Time in seconds: {:.18e}", report.seconds);
        println!("Max error: {:.18e}", report.max_error);
    }
    Ok(())
}
