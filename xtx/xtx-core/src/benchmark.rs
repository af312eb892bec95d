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


//! Benchmark harness: the block pipeline end to end and the whole-buffer
//! allreduce baseline. Timed regions are bracketed by a device synchronize and
//! a barrier on every rank; wall time comes from the host collective's clock.

use crate::comm::{DeviceAwareCollective, DeviceCollective, HostCollective};
use crate::config::PipelineConfig;
use crate::device::DeviceRuntime;
use crate::error::{GramError, Result};
use crate::pipeline::compute_distributed_gram_blocks;
use crate::reduction::ReductionBackend;

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Whole-buffer allreduce baseline parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct AllreduceBaselineConfig {
    /// Doubles in the reduced buffer
    pub len: usize,
    /// Back-to-back reductions per timed region
    pub iterations: usize,
    pub fill: f64,
}

impl AllreduceBaselineConfig {
    /// 10,000,000 doubles reduced 50 times.
    pub fn production() -> Self {
        Self {
            len: 10_000_000,
            iterations: 50,
            fill: 0.1,
        }
    }

    /// Defaults overridden by XTX_BENCH_ALLREDUCE_LEN / XTX_BENCH_ALLREDUCE_ITERS.
    pub fn from_env(self) -> Self {
        Self {
            len: env_usize("XTX_BENCH_ALLREDUCE_LEN").unwrap_or(self.len),
            iterations: env_usize("XTX_BENCH_ALLREDUCE_ITERS").unwrap_or(self.iterations),
            ..self
        }
    }
}

impl Default for AllreduceBaselineConfig {
    fn default() -> Self {
        Self {
            len: 100_000,
            ..Self::production()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AllreduceBaselineReport {
    pub nprocs: usize,
    pub len: usize,
    pub iterations: usize,
    pub device_direct_seconds: Option<f64>,
    pub device_aware_seconds: Option<f64>,
}

/// Time `iterations` in-place reductions of one device buffer on each available path.
///
/// The device-direct path creates its own data-move stream inside the timed
/// region and destroys it before the region closes.
pub fn run_allreduce_baseline<R, C>(
    runtime: &R,
    comm: &C,
    device_collective: Option<&dyn DeviceCollective<R, f64>>,
    device_aware: Option<&dyn DeviceAwareCollective<R, f64>>,
    config: &AllreduceBaselineConfig,
) -> Result<AllreduceBaselineReport>
where
    R: DeviceRuntime,
    C: HostCollective,
{
    crate::profile_scope!("Bench::AllreduceBaseline");
    let mut buffer = runtime.alloc(config.len, config.fill)?;
    let mut report = AllreduceBaselineReport {
        nprocs: comm.size(),
        len: config.len,
        iterations: config.iterations,
        device_direct_seconds: None,
        device_aware_seconds: None,
    };

    if let Some(collective) = device_collective {
        runtime.synchronize()?;
        comm.barrier()?;
        let t1 = comm.wtime();

        let stream = runtime.create_stream()?;
        for _ in 0..config.iterations {
            collective.all_reduce_sum_in_place(runtime, &buffer, config.len, &stream)?;
        }
        runtime.synchronize_stream(&stream)?;
        runtime.destroy_stream(stream)?;

        runtime.synchronize()?;
        comm.barrier()?;
        let t2 = comm.wtime();
        report.device_direct_seconds = Some(t2 - t1);
        log::info!("Device-direct allreduce baseline: {:.6} s", t2 - t1);
    }

    if let Some(aware) = device_aware {
        runtime.synchronize()?;
        comm.barrier()?;
        let t1 = comm.wtime();

        for _ in 0..config.iterations {
            aware.all_reduce_sum_device(runtime, &mut buffer, config.len)?;
        }

        runtime.synchronize()?;
        comm.barrier()?;
        let t2 = comm.wtime();
        report.device_aware_seconds = Some(t2 - t1);
        log::info!("Device-aware allreduce baseline: {:.6} s", t2 - t1);
    }

    Ok(report)
}

/// Gram benchmark problem size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct XtxBenchmarkConfig {
    /// Rows of the global matrix, split evenly across ranks
    pub global_num_dofs: usize,
    /// Columns of the global matrix
    pub number_vectors: usize,
}

impl XtxBenchmarkConfig {
    /// Roughly 100k to 50k dofs per device when scaling from 2 to 4 devices.
    pub fn production() -> Self {
        Self {
            global_num_dofs: 70_000,
            number_vectors: 36_600,
        }
    }

    /// Defaults overridden by XTX_BENCH_DOFS / XTX_BENCH_VECTORS.
    pub fn from_env(self) -> Self {
        Self {
            global_num_dofs: env_usize("XTX_BENCH_DOFS").unwrap_or(self.global_num_dofs),
            number_vectors: env_usize("XTX_BENCH_VECTORS").unwrap_or(self.number_vectors),
        }
    }

    pub fn local_num_dofs(&self, nprocs: usize) -> usize {
        self.global_num_dofs / nprocs.max(1)
    }
}

impl Default for XtxBenchmarkConfig {
    fn default() -> Self {
        Self {
            global_num_dofs: 2048,
            number_vectors: 1536,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct XtxBenchmarkReport {
    pub nprocs: usize,
    pub local_num_dofs: usize,
    pub number_vectors: usize,
    pub block_size: usize,
    pub blocks: usize,
    pub seconds: f64,
    /// Largest deviation of a reduced entry from `nprocs * local / nv^2`
    pub max_error: f64,
}

/// Run the block pipeline on a constant matrix and time it.
///
/// The block size comes from `pipeline`, defaulted and validated against
/// `number_vectors` before any device allocation. Every entry of the local matrix is `1 / number_vectors`, so every reduced
/// Gram entry must equal `nprocs * local_num_dofs / number_vectors^2`.
pub fn run_xtx_benchmark<R, C>(
    runtime: &R,
    comm: &C,
    reduction: &ReductionBackend<'_, R, f64>,
    config: &XtxBenchmarkConfig,
    pipeline: &PipelineConfig,
) -> Result<XtxBenchmarkReport>
where
    R: DeviceRuntime,
    C: HostCollective,
{
    crate::profile_scope!("Bench::XtX");
    let nprocs = comm.size();
    let local = config.local_num_dofs(nprocs);
    let nv = config.number_vectors;
    if nv == 0 {
        return Err(GramError::Precondition(
            "numberVectors must be greater than zero".to_string(),
        ));
    }
    let pipeline = pipeline.clone().with_defaults(nv);
    pipeline.validate(nv)?;
    let block_size = pipeline.resolved_block_size()?;
    let fill = 1.0 / nv as f64;
    let expected = nprocs as f64 * local as f64 * fill * fill;

    let x = runtime.alloc(local * nv, fill)?;
    let mut handle = runtime.create_blas_handle()?;
    let mut max_error = 0.0f64;

    runtime.synchronize()?;
    comm.barrier()?;
    let t1 = comm.wtime();

    let summary = compute_distributed_gram_blocks(
        runtime,
        &x,
        local,
        nv,
        block_size,
        &mut handle,
        comm,
        reduction,
        |block| {
            let worst = block
                .data
                .iter()
                .map(|v| (v - expected).abs())
                .fold(0.0f64, f64::max);
            max_error = max_error.max(worst);
            Ok(())
        },
    )?;

    runtime.synchronize()?;
    comm.barrier()?;
    let t2 = comm.wtime();
    log::info!(
        "XtX benchmark: {} blocks in {:.6} s, max error {:e}",
        summary.blocks,
        t2 - t1,
        max_error
    );

    Ok(XtxBenchmarkReport {
        nprocs,
        local_num_dofs: local,
        number_vectors: nv,
        block_size,
        blocks: summary.blocks,
        seconds: t2 - t1,
        max_error,
    })
}
