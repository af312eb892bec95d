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


//! CUDA runtime, cuBLAS and NCCL FFI declarations.

use std::ffi::c_void;

pub(crate) const CUDA_SUCCESS: i32 = 0;
pub(crate) const CUDA_EVENT_DISABLE_TIMING: u32 = 0x02;
pub(crate) const CUDA_STREAM_NON_BLOCKING: u32 = 0x01;
pub(crate) const CUDA_HOST_ALLOC_DEFAULT: u32 = 0x00;

pub(crate) const CUDA_MEMCPY_HOST_TO_DEVICE: u32 = 1;
pub(crate) const CUDA_MEMCPY_DEVICE_TO_HOST: u32 = 2;

pub(crate) const CUBLAS_STATUS_SUCCESS: i32 = 0;
pub(crate) const CUBLAS_OP_N: i32 = 0;
pub(crate) const CUBLAS_OP_T: i32 = 1;

pub(crate) const NCCL_SUCCESS: i32 = 0;
pub(crate) const NCCL_SUM: i32 = 0;
pub(crate) const NCCL_FLOAT32: i32 = 7;
pub(crate) const NCCL_FLOAT64: i32 = 8;
pub(crate) const NCCL_UNIQUE_ID_BYTES: usize = 128;

/// Opaque `ncclUniqueId`, passed by value.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct NcclUniqueId {
    pub(crate) internal: [u8; NCCL_UNIQUE_ID_BYTES],
}

#[link(name = "cudart")]
unsafe extern "C" {
    pub(crate) fn cudaSetDevice(device: i32) -> i32;
    pub(crate) fn cudaGetDeviceCount(count: *mut i32) -> i32;
    pub(crate) fn cudaDeviceSynchronize() -> i32;

    pub(crate) fn cudaStreamCreateWithFlags(stream: *mut *mut c_void, flags: u32) -> i32;
    pub(crate) fn cudaStreamDestroy(stream: *mut c_void) -> i32;
    pub(crate) fn cudaStreamSynchronize(stream: *mut c_void) -> i32;

    pub(crate) fn cudaEventCreateWithFlags(event: *mut *mut c_void, flags: u32) -> i32;
    pub(crate) fn cudaEventRecord(event: *mut c_void, stream: *mut c_void) -> i32;
    pub(crate) fn cudaEventDestroy(event: *mut c_void) -> i32;
    /// Waits until the completion of all work currently captured in the event.
    pub(crate) fn cudaEventSynchronize(event: *mut c_void) -> i32;

    pub(crate) fn cudaMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub(crate) fn cudaFree(ptr: *mut c_void) -> i32;
    pub(crate) fn cudaHostAlloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub(crate) fn cudaFreeHost(ptr: *mut c_void) -> i32;

    pub(crate) fn cudaMemcpy(dst: *mut c_void, src: *const c_void, count: usize, kind: u32) -> i32;
    pub(crate) fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: usize,
        kind: u32,
        stream: *mut c_void,
    ) -> i32;
}

#[link(name = "cublas")]
unsafe extern "C" {
    pub(crate) fn cublasCreate_v2(handle: *mut *mut c_void) -> i32;
    pub(crate) fn cublasDestroy_v2(handle: *mut c_void) -> i32;
    pub(crate) fn cublasSetStream_v2(handle: *mut c_void, stream: *mut c_void) -> i32;

    pub(crate) fn cublasSgemm_v2(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        k: i32,
        alpha: *const f32,
        a: *const f32,
        lda: i32,
        b: *const f32,
        ldb: i32,
        beta: *const f32,
        c: *mut f32,
        ldc: i32,
    ) -> i32;

    pub(crate) fn cublasDgemm_v2(
        handle: *mut c_void,
        transa: i32,
        transb: i32,
        m: i32,
        n: i32,
        k: i32,
        alpha: *const f64,
        a: *const f64,
        lda: i32,
        b: *const f64,
        ldb: i32,
        beta: *const f64,
        c: *mut f64,
        ldc: i32,
    ) -> i32;
}

#[link(name = "nccl")]
unsafe extern "C" {
    pub(crate) fn ncclGetUniqueId(id: *mut NcclUniqueId) -> i32;
    pub(crate) fn ncclCommInitRank(comm: *mut *mut c_void, nranks: i32, id: NcclUniqueId, rank: i32) -> i32;
    pub(crate) fn ncclCommDestroy(comm: *mut c_void) -> i32;
    pub(crate) fn ncclAllReduce(
        sendbuff: *const c_void,
        recvbuff: *mut c_void,
        count: usize,
        datatype: i32,
        op: i32,
        comm: *mut c_void,
        stream: *mut c_void,
    ) -> i32;
}
