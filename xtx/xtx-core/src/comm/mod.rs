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


//! Collective communication between cooperating ranks.
//!
//! Three seams, mirroring the reduction strategies the pipeline can use:
//! a host collective over host memory, a device collective that reduces a
//! device buffer in place on a stream, and a device-aware message-passing
//! collective that accepts device buffers directly.

mod local;
#[cfg(feature = "cuda")]
pub mod nccl;
mod sim_direct;

pub use local::LocalCommunicator;
pub use sim_direct::SimDeviceCollective;

use crate::device::DeviceRuntime;
use crate::error::Result;
use crate::types::GramScalar;

/// Message-passing collective over host memory.
///
/// Every member of a group must enter each collective call in the same order.
pub trait HostCollective: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Wall-clock seconds since a fixed, group-wide origin.
    fn wtime(&self) -> f64;

    /// Element-wise sum across ranks; every rank receives the result.
    fn all_reduce_sum_in_place<T: GramScalar>(&self, data: &mut [T]) -> Result<()>;

    /// Replace `data` on every rank with the root's bytes.
    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) -> Result<()>;
}

/// In-place sum across ranks of a device buffer, ordered on a stream.
///
/// Completion is observed through an event recorded on the same stream.
pub trait DeviceCollective<R: DeviceRuntime, T: GramScalar> {
    fn all_reduce_sum_in_place(
        &self,
        runtime: &R,
        buffer: &R::Buffer<T>,
        count: usize,
        stream: &R::Stream,
    ) -> Result<()>;
}

/// Message-passing sum that accepts device-resident buffers.
///
/// The call blocks until the reduction is complete. Pending device work writing
/// `buffer` must have completed before the call.
pub trait DeviceAwareCollective<R: DeviceRuntime, T: GramScalar> {
    fn all_reduce_sum_device(&self, runtime: &R, buffer: &mut R::Buffer<T>, count: usize) -> Result<()>;
}
