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


//! Distributed, device-resident Gram matrix (X^T X) computation.
//!
//! The core is a software-pipelined block algorithm that overlaps device GEMM,
//! device-to-host copies and cross-process reductions of consecutive blocks
//! (see [`pipeline::compute_distributed_gram_blocks`]). Device runtimes and
//! collectives are pluggable: [`device::sim::SimDevice`] runs everything in host
//! memory for tests and benchmarks, the `cuda` feature adds CUDA/cuBLAS/NCCL.

#[macro_use]
mod profiling;

pub mod benchmark;
pub mod block;
pub mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod pipeline;
pub mod reduction;
pub mod types;

pub use block::{BlockPlan, BlockSpec, DenseGramAssembler, GramBlock, OwnedGramBlock, reference_gram};
pub use comm::{DeviceAwareCollective, DeviceCollective, HostCollective, LocalCommunicator};
pub use config::PipelineConfig;
pub use device::sim::{FaultPoint, SimDevice, TraceEvent};
pub use device::{DeviceBuffer, DeviceRuntime, PinnedBuffer, Transpose};
pub use error::{GramError, Result};
pub use pipeline::{PingPong, PipelineContext, PipelineSummary, compute_distributed_gram_blocks};
pub use reduction::{BackendCapabilities, ReductionBackend, ReductionPath};
pub use types::GramScalar;
