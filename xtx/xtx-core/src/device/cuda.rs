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


//! CUDA runtime backed by cudarc, the CUDA runtime API and cuBLAS.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::Arc;

use cudarc::driver::CudaDevice;

use super::cuda_ffi::{
    CUBLAS_OP_N, CUBLAS_OP_T, CUBLAS_STATUS_SUCCESS, CUDA_EVENT_DISABLE_TIMING, CUDA_HOST_ALLOC_DEFAULT,
    CUDA_MEMCPY_DEVICE_TO_HOST, CUDA_MEMCPY_HOST_TO_DEVICE, CUDA_STREAM_NON_BLOCKING, CUDA_SUCCESS,
    cublasCreate_v2, cublasDestroy_v2, cublasSetStream_v2, cudaDeviceSynchronize, cudaEventCreateWithFlags,
    cudaEventDestroy, cudaEventRecord, cudaEventSynchronize, cudaFree, cudaFreeHost, cudaGetDeviceCount,
    cudaHostAlloc, cudaMalloc, cudaMemcpy, cudaMemcpyAsync, cudaSetDevice, cudaStreamCreateWithFlags,
    cudaStreamDestroy, cudaStreamSynchronize,
};
use super::{DeviceBuffer, DeviceRuntime, GemmOp, PinnedBuffer, Transpose};
use crate::error::{GramError, Result, cuda_error_to_string};
use crate::types::GramScalar;

fn check(ret: i32, what: &str, kind: fn(String) -> GramError) -> Result<()> {
    if ret != CUDA_SUCCESS {
        return Err(kind(format!(
            "{} failed: {} ({})",
            what,
            ret,
            cuda_error_to_string(ret)
        )));
    }
    Ok(())
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        GramError::DeviceOperation(format!("{} = {} exceeds the cuBLAS index range", what, value))
    })
}

/// Number of visible CUDA devices.
pub fn device_count() -> Result<usize> {
    let mut count = 0i32;
    check(
        unsafe { cudaGetDeviceCount(&mut count) },
        "cudaGetDeviceCount",
        GramError::DeviceResource,
    )?;
    Ok(count.max(0) as usize)
}

/// Non-blocking CUDA stream.
pub struct CudaStream {
    raw: *mut c_void,
}

impl CudaStream {
    pub(crate) fn raw(&self) -> *mut c_void {
        self.raw
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe {
                let _ = cudaStreamSynchronize(self.raw);
                let _ = cudaStreamDestroy(self.raw);
            }
        }
    }
}

pub struct CudaEvent {
    raw: *mut c_void,
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe {
                let _ = cudaEventDestroy(self.raw);
            }
        }
    }
}

/// Device allocation of `len` elements.
pub struct CudaBuffer<T> {
    ptr: *mut T,
    len: usize,
}

impl<T> CudaBuffer<T> {
    pub(crate) fn ptr(&self) -> *mut T {
        self.ptr
    }
}

impl<T> DeviceBuffer<T> for CudaBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }
}

impl<T> Drop for CudaBuffer<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                let _ = cudaFree(self.ptr as *mut c_void);
            }
        }
    }
}

/// Page-locked host allocation from `cudaHostAlloc`.
pub struct CudaPinned<T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> PinnedBuffer<T> for CudaPinned<T> {
    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }
}

impl<T> Drop for CudaPinned<T> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                let _ = cudaFreeHost(self.ptr as *mut c_void);
            }
        }
    }
}

pub struct CublasHandle {
    raw: *mut c_void,
}

impl Drop for CublasHandle {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            unsafe {
                let _ = cublasDestroy_v2(self.raw);
            }
        }
    }
}

/// One CUDA device, selected by ordinal.
#[derive(Clone)]
pub struct CudaRuntime {
    device: Arc<CudaDevice>,
    ordinal: usize,
}

impl CudaRuntime {
    pub fn new(ordinal: usize) -> Result<Self> {
        let device = CudaDevice::new(ordinal).map_err(|e| {
            GramError::DeviceResource(format!("Failed to initialize CUDA device {}: {:?}", ordinal, e))
        })?;
        check(
            unsafe { cudaSetDevice(to_i32(ordinal, "device ordinal")?) },
            "cudaSetDevice",
            GramError::DeviceResource,
        )?;
        log::debug!("CUDA device {} initialized", ordinal);
        Ok(Self { device, ordinal })
    }

    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    fn raw_alloc<T: GramScalar>(&self, len: usize) -> Result<CudaBuffer<T>> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let bytes = len.max(1) * T::size_bytes();
        check(
            unsafe { cudaMalloc(&mut ptr, bytes) },
            "cudaMalloc",
            GramError::MemoryAllocation,
        )?;
        Ok(CudaBuffer {
            ptr: ptr as *mut T,
            len,
        })
    }
}

impl DeviceRuntime for CudaRuntime {
    type Stream = CudaStream;
    type Event = CudaEvent;
    type Buffer<T: GramScalar> = CudaBuffer<T>;
    type Pinned<T: GramScalar> = CudaPinned<T>;
    type BlasHandle = CublasHandle;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn create_stream(&self) -> Result<CudaStream> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        check(
            unsafe { cudaStreamCreateWithFlags(&mut raw, CUDA_STREAM_NON_BLOCKING) },
            "cudaStreamCreateWithFlags",
            GramError::DeviceResource,
        )?;
        Ok(CudaStream { raw })
    }

    fn destroy_stream(&self, mut stream: CudaStream) -> Result<()> {
        let raw = std::mem::replace(&mut stream.raw, std::ptr::null_mut());
        let synced = check(
            unsafe { cudaStreamSynchronize(raw) },
            "cudaStreamSynchronize",
            GramError::DeviceOperation,
        );
        let destroyed = check(
            unsafe { cudaStreamDestroy(raw) },
            "cudaStreamDestroy",
            GramError::DeviceResource,
        );
        synced.and(destroyed)
    }

    fn synchronize_stream(&self, stream: &CudaStream) -> Result<()> {
        check(
            unsafe { cudaStreamSynchronize(stream.raw) },
            "cudaStreamSynchronize",
            GramError::DeviceOperation,
        )
    }

    fn create_event(&self) -> Result<CudaEvent> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        check(
            unsafe { cudaEventCreateWithFlags(&mut raw, CUDA_EVENT_DISABLE_TIMING) },
            "cudaEventCreateWithFlags",
            GramError::DeviceResource,
        )?;
        Ok(CudaEvent { raw })
    }

    fn destroy_event(&self, mut event: CudaEvent) -> Result<()> {
        let raw = std::mem::replace(&mut event.raw, std::ptr::null_mut());
        check(
            unsafe { cudaEventDestroy(raw) },
            "cudaEventDestroy",
            GramError::DeviceResource,
        )
    }

    fn record_event(&self, event: &CudaEvent, stream: &CudaStream) -> Result<()> {
        check(
            unsafe { cudaEventRecord(event.raw, stream.raw) },
            "cudaEventRecord",
            GramError::DeviceOperation,
        )
    }

    fn synchronize_event(&self, event: &CudaEvent) -> Result<()> {
        check(
            unsafe { cudaEventSynchronize(event.raw) },
            "cudaEventSynchronize",
            GramError::DeviceOperation,
        )
    }

    fn synchronize(&self) -> Result<()> {
        check(
            unsafe { cudaDeviceSynchronize() },
            "cudaDeviceSynchronize",
            GramError::DeviceOperation,
        )
    }

    fn alloc<T: GramScalar>(&self, len: usize, fill: T) -> Result<CudaBuffer<T>> {
        let host = vec![fill; len];
        self.alloc_from_host(&host)
    }

    fn alloc_from_host<T: GramScalar>(&self, data: &[T]) -> Result<CudaBuffer<T>> {
        let buffer = self.raw_alloc::<T>(data.len())?;
        if !data.is_empty() {
            check(
                unsafe {
                    cudaMemcpy(
                        buffer.ptr as *mut c_void,
                        data.as_ptr() as *const c_void,
                        std::mem::size_of_val(data),
                        CUDA_MEMCPY_HOST_TO_DEVICE,
                    )
                },
                "cudaMemcpy H2D",
                GramError::DeviceOperation,
            )?;
        }
        Ok(buffer)
    }

    fn alloc_pinned<T: GramScalar>(&self, len: usize, fill: T) -> Result<CudaPinned<T>> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        check(
            unsafe { cudaHostAlloc(&mut ptr, len.max(1) * T::size_bytes(), CUDA_HOST_ALLOC_DEFAULT) },
            "cudaHostAlloc",
            GramError::MemoryAllocation,
        )?;
        let mut pinned = CudaPinned {
            ptr: ptr as *mut T,
            len,
            _marker: PhantomData,
        };
        pinned.as_mut_slice().fill(fill);
        Ok(pinned)
    }

    fn copy_to_vec<T: GramScalar>(&self, src: &CudaBuffer<T>) -> Result<Vec<T>> {
        let mut host = vec![T::zero(); src.len];
        if src.len > 0 {
            check(
                unsafe {
                    cudaMemcpy(
                        host.as_mut_ptr() as *mut c_void,
                        src.ptr as *const c_void,
                        src.len * T::size_bytes(),
                        CUDA_MEMCPY_DEVICE_TO_HOST,
                    )
                },
                "cudaMemcpy D2H",
                GramError::DeviceOperation,
            )?;
        }
        Ok(host)
    }

    unsafe fn copy_to_host_async<T: GramScalar>(
        &self,
        dst: &mut CudaPinned<T>,
        src: &CudaBuffer<T>,
        len: usize,
        stream: &CudaStream,
    ) -> Result<()> {
        if len > src.len || len > dst.len {
            return Err(GramError::DeviceOperation(format!(
                "Copy of {} elements exceeds source ({}) or destination ({})",
                len, src.len, dst.len
            )));
        }
        check(
            unsafe {
                cudaMemcpyAsync(
                    dst.ptr as *mut c_void,
                    src.ptr as *const c_void,
                    len * T::size_bytes(),
                    CUDA_MEMCPY_DEVICE_TO_HOST,
                    stream.raw,
                )
            },
            "cudaMemcpyAsync D2H",
            GramError::DeviceOperation,
        )
    }

    fn create_blas_handle(&self) -> Result<CublasHandle> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let status = unsafe { cublasCreate_v2(&mut raw) };
        if status != CUBLAS_STATUS_SUCCESS {
            return Err(GramError::DeviceResource(format!("cublasCreate failed: {}", status)));
        }
        Ok(CublasHandle { raw })
    }

    fn set_blas_stream(&self, handle: &mut CublasHandle, stream: Option<&CudaStream>) -> Result<()> {
        let raw = stream.map_or(std::ptr::null_mut(), |s| s.raw);
        let status = unsafe { cublasSetStream_v2(handle.raw, raw) };
        if status != CUBLAS_STATUS_SUCCESS {
            return Err(GramError::DeviceResource(format!("cublasSetStream failed: {}", status)));
        }
        Ok(())
    }

    fn gemm<T: GramScalar>(
        &self,
        handle: &CublasHandle,
        op: GemmOp<'_, CudaBuffer<T>, T>,
        c: &mut CudaBuffer<T>,
    ) -> Result<()> {
        op.validate(op.a.len, op.b.len, c.len)?;
        if op.m == 0 || op.n == 0 {
            return Ok(());
        }
        let trans = |t: Transpose| match t {
            Transpose::None => CUBLAS_OP_N,
            Transpose::Transpose => CUBLAS_OP_T,
        };
        crate::profile_scope!("GPU::Gemm");
        let status = unsafe {
            T::cublas_gemm(
                handle.raw,
                trans(op.trans_a),
                trans(op.trans_b),
                to_i32(op.m, "m")?,
                to_i32(op.n, "n")?,
                to_i32(op.k, "k")?,
                &op.alpha,
                op.a.ptr.add(op.a_offset),
                to_i32(op.lda, "lda")?,
                op.b.ptr.add(op.b_offset),
                to_i32(op.ldb, "ldb")?,
                &op.beta,
                c.ptr,
                to_i32(op.ldc, "ldc")?,
            )
        };
        if status != CUBLAS_STATUS_SUCCESS {
            return Err(GramError::DeviceOperation(format!(
                "cuBLAS {} GEMM failed: {}",
                T::TYPE_NAME,
                status
            )));
        }
        Ok(())
    }
}
