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


//! NCCL device-direct collective for CUDA.

use std::ffi::c_void;

use super::{DeviceCollective, HostCollective};
use crate::device::cuda::{CudaBuffer, CudaRuntime, CudaStream};
use crate::device::cuda_ffi::{
    NCCL_SUCCESS, NCCL_SUM, NCCL_UNIQUE_ID_BYTES, NcclUniqueId, ncclAllReduce, ncclCommDestroy,
    ncclCommInitRank, ncclGetUniqueId,
};
use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// NCCL communicator spanning every rank of a host collective.
pub struct NcclCollective {
    comm: *mut c_void,
    rank: usize,
    size: usize,
}

impl NcclCollective {
    /// Collective over `host`: rank 0 creates the unique id and broadcasts it.
    pub fn init<C: HostCollective>(host: &C) -> Result<Self> {
        let mut id = NcclUniqueId {
            internal: [0u8; NCCL_UNIQUE_ID_BYTES],
        };
        if host.rank() == 0 {
            let ret = unsafe { ncclGetUniqueId(&mut id) };
            if ret != NCCL_SUCCESS {
                return Err(GramError::Collective(format!("ncclGetUniqueId failed: {}", ret)));
            }
        }
        let mut bytes = id.internal.to_vec();
        host.broadcast_bytes(0, &mut bytes)?;
        if bytes.len() != NCCL_UNIQUE_ID_BYTES {
            return Err(GramError::Collective(format!(
                "Received NCCL id of {} bytes, expected {}",
                bytes.len(),
                NCCL_UNIQUE_ID_BYTES
            )));
        }
        id.internal.copy_from_slice(&bytes);

        let size = i32::try_from(host.size())
            .map_err(|_| GramError::Collective(format!("Group of {} ranks is too large", host.size())))?;
        let rank = host.rank() as i32;
        let mut comm: *mut c_void = std::ptr::null_mut();
        let ret = unsafe { ncclCommInitRank(&mut comm, size, id, rank) };
        if ret != NCCL_SUCCESS {
            return Err(GramError::Collective(format!("ncclCommInitRank failed: {}", ret)));
        }
        log::debug!("NCCL communicator ready: rank {} of {}", rank, size);
        Ok(Self {
            comm,
            rank: host.rank(),
            size: host.size(),
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for NcclCollective {
    fn drop(&mut self) {
        if !self.comm.is_null() {
            unsafe {
                let _ = ncclCommDestroy(self.comm);
            }
        }
    }
}

impl<T: GramScalar> DeviceCollective<CudaRuntime, T> for NcclCollective {
    fn all_reduce_sum_in_place(
        &self,
        _runtime: &CudaRuntime,
        buffer: &CudaBuffer<T>,
        count: usize,
        stream: &CudaStream,
    ) -> Result<()> {
        use crate::device::DeviceBuffer;
        if count > buffer.len() {
            return Err(GramError::Collective(format!(
                "Reduction of {} elements exceeds buffer of {}",
                count,
                buffer.len()
            )));
        }
        let ptr = buffer.ptr() as *mut c_void;
        let ret = unsafe {
            ncclAllReduce(
                ptr,
                ptr,
                count,
                T::NCCL_DATA_TYPE,
                NCCL_SUM,
                self.comm,
                stream.raw(),
            )
        };
        if ret != NCCL_SUCCESS {
            return Err(GramError::Collective(format!("ncclAllReduce failed: {}", ret)));
        }
        Ok(())
    }
}
