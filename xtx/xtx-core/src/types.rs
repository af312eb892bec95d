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


//! Element types of the Gram pipeline.
//!
//! The reduction operator is always addition and the element type is fixed at
//! compile time: every backend resolves its wire type through the associated
//! items of [`GramScalar`] instead of inspecting values at runtime.

#[cfg(feature = "cuda")]
use std::ffi::c_void;

/// Field type supported by the GEMM and reduction primitives.
pub trait GramScalar:
    num_traits::Float + Default + Send + Sync + std::fmt::Debug + std::iter::Sum + 'static
{
    /// Human-readable type name for logs and benchmark output
    const TYPE_NAME: &'static str;

    /// `ncclDataType_t` of this element type
    #[cfg(feature = "cuda")]
    const NCCL_DATA_TYPE: i32;

    /// Size in bytes
    fn size_bytes() -> usize {
        std::mem::size_of::<Self>()
    }

    /// Column-major GEMM on device memory through cuBLAS.
    ///
    /// Returns the `cublasStatus_t` code (0 = success).
    ///
    /// # Safety
    /// `handle` must be a live cuBLAS handle; `a`, `b`, `c` must be device pointers valid
    /// for the extents implied by the dimensions and leading dimensions.
    #[cfg(feature = "cuda")]
    #[allow(clippy::too_many_arguments)]
    unsafe fn cublas_gemm(
        handle: *mut c_void,
        trans_a: i32,
        trans_b: i32,
        m: i32,
        n: i32,
        k: i32,
        alpha: &Self,
        a: *const Self,
        lda: i32,
        b: *const Self,
        ldb: i32,
        beta: &Self,
        c: *mut Self,
        ldc: i32,
    ) -> i32;
}

impl GramScalar for f32 {
    const TYPE_NAME: &'static str = "f32";
    #[cfg(feature = "cuda")]
    const NCCL_DATA_TYPE: i32 = crate::device::cuda_ffi::NCCL_FLOAT32;

    #[cfg(feature = "cuda")]
    unsafe fn cublas_gemm(
        handle: *mut c_void,
        trans_a: i32,
        trans_b: i32,
        m: i32,
        n: i32,
        k: i32,
        alpha: &Self,
        a: *const Self,
        lda: i32,
        b: *const Self,
        ldb: i32,
        beta: &Self,
        c: *mut Self,
        ldc: i32,
    ) -> i32 {
        unsafe {
            crate::device::cuda_ffi::cublasSgemm_v2(
                handle, trans_a, trans_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc,
            )
        }
    }
}

impl GramScalar for f64 {
    const TYPE_NAME: &'static str = "f64";
    #[cfg(feature = "cuda")]
    const NCCL_DATA_TYPE: i32 = crate::device::cuda_ffi::NCCL_FLOAT64;

    #[cfg(feature = "cuda")]
    unsafe fn cublas_gemm(
        handle: *mut c_void,
        trans_a: i32,
        trans_b: i32,
        m: i32,
        n: i32,
        k: i32,
        alpha: &Self,
        a: *const Self,
        lda: i32,
        b: *const Self,
        ldb: i32,
        beta: &Self,
        c: *mut Self,
        ldc: i32,
    ) -> i32 {
        unsafe {
            crate::device::cuda_ffi::cublasDgemm_v2(
                handle, trans_a, trans_b, m, n, k, alpha, a, lda, b, ldb, beta, c, ldc,
            )
        }
    }
}
