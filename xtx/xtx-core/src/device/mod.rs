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


//! Device runtime abstraction consumed by the Gram pipeline.
//!
//! A runtime provides ordered asynchronous queues (streams), host-awaitable
//! completion markers (events), typed device and pinned host storage, an
//! asynchronous device-to-host copy and a stream-bound GEMM. Every call returns
//! a checkable [`Result`]; nothing proceeds with an unusable handle.

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "cuda")]
pub(crate) mod cuda_ffi;
pub mod sim;

use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// Operand transposition for GEMM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transpose {
    /// `op(A) = A`
    None,
    /// `op(A) = A^T`
    Transpose,
}

/// Typed device-resident storage.
pub trait DeviceBuffer<T> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Page-locked host storage, target of asynchronous device-to-host copies.
pub trait PinnedBuffer<T> {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_slice(&self) -> &[T];

    fn as_mut_slice(&mut self) -> &mut [T];

    fn as_mut_ptr(&mut self) -> *mut T;
}

/// Column-major GEMM `C = alpha * op(A) * op(B) + beta * C` on device buffers.
///
/// `A`, `B` and `C` start at element offsets `a_offset`, `b_offset` and 0 of
/// their buffers. `beta == 0` overwrites `C` without reading it.
pub struct GemmOp<'a, B, T> {
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: T,
    pub a: &'a B,
    pub a_offset: usize,
    pub lda: usize,
    pub b: &'a B,
    pub b_offset: usize,
    pub ldb: usize,
    pub beta: T,
    pub ldc: usize,
}

impl<B, T> GemmOp<'_, B, T> {
    /// Highest element index (exclusive) touched in `A`, `B` and `C`.
    pub fn extents(&self) -> (usize, usize, usize) {
        fn extent(trans: Transpose, rows: usize, cols: usize, offset: usize, ld: usize) -> usize {
            // stored rows x cols where op() is applied afterwards
            let (stored_rows, stored_cols) = match trans {
                Transpose::None => (rows, cols),
                Transpose::Transpose => (cols, rows),
            };
            if stored_rows == 0 || stored_cols == 0 {
                return 0;
            }
            offset + (stored_cols - 1) * ld + stored_rows
        }
        let a = extent(self.trans_a, self.m, self.k, self.a_offset, self.lda);
        let b = extent(self.trans_b, self.k, self.n, self.b_offset, self.ldb);
        let c = if self.m == 0 || self.n == 0 {
            0
        } else {
            (self.n - 1) * self.ldc + self.m
        };
        (a, b, c)
    }

    /// Check leading dimensions and operand extents against buffer lengths.
    pub fn validate(&self, a_len: usize, b_len: usize, c_len: usize) -> Result<()> {
        let stored_rows = |trans: Transpose, rows: usize, cols: usize| match trans {
            Transpose::None => rows,
            Transpose::Transpose => cols,
        };
        let rows_a = stored_rows(self.trans_a, self.m, self.k);
        let rows_b = stored_rows(self.trans_b, self.k, self.n);
        if self.lda < rows_a.max(1) || self.ldb < rows_b.max(1) || self.ldc < self.m.max(1) {
            return Err(GramError::DeviceOperation(format!(
                "Invalid leading dimensions lda={} ldb={} ldc={} for m={} n={} k={}",
                self.lda, self.ldb, self.ldc, self.m, self.n, self.k
            )));
        }
        let (extent_a, extent_b, extent_c) = self.extents();
        if extent_a > a_len || extent_b > b_len || extent_c > c_len {
            return Err(GramError::DeviceOperation(format!(
                "GEMM operands out of range: A needs {} of {}, B needs {} of {}, C needs {} of {}",
                extent_a, a_len, extent_b, b_len, extent_c, c_len
            )));
        }
        Ok(())
    }
}

/// Accelerator runtime: streams, events, memory, copies and BLAS.
///
/// Streams and events release themselves on drop; the explicit `destroy_*`
/// calls exist so that a normal teardown can report failures.
pub trait DeviceRuntime {
    type Stream;
    type Event;
    type Buffer<T: GramScalar>: DeviceBuffer<T>;
    type Pinned<T: GramScalar>: PinnedBuffer<T>;
    type BlasHandle;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn create_stream(&self) -> Result<Self::Stream>;

    fn destroy_stream(&self, stream: Self::Stream) -> Result<()>;

    /// Block the host until all work issued to `stream` has completed.
    fn synchronize_stream(&self, stream: &Self::Stream) -> Result<()>;

    fn create_event(&self) -> Result<Self::Event>;

    fn destroy_event(&self, event: Self::Event) -> Result<()>;

    /// Capture the work issued to `stream` so far in `event`.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> Result<()>;

    /// Block the host until the work captured by the last record has completed.
    ///
    /// Returns the error of any failed operation the event waited on.
    fn synchronize_event(&self, event: &Self::Event) -> Result<()>;

    /// Block the host until all streams are idle.
    fn synchronize(&self) -> Result<()>;

    /// Device buffer of `len` elements, each set to `fill`.
    fn alloc<T: GramScalar>(&self, len: usize, fill: T) -> Result<Self::Buffer<T>>;

    /// Device buffer initialised from host data.
    fn alloc_from_host<T: GramScalar>(&self, data: &[T]) -> Result<Self::Buffer<T>>;

    /// Replace `buffer` with a fresh allocation of `len` elements set to `fill`.
    fn resize<T: GramScalar>(&self, buffer: &mut Self::Buffer<T>, len: usize, fill: T) -> Result<()> {
        *buffer = self.alloc(len, fill)?;
        Ok(())
    }

    /// Pinned host buffer of `len` elements, each set to `fill`.
    fn alloc_pinned<T: GramScalar>(&self, len: usize, fill: T) -> Result<Self::Pinned<T>>;

    /// Blocking copy of a whole device buffer to a new host vector.
    fn copy_to_vec<T: GramScalar>(&self, src: &Self::Buffer<T>) -> Result<Vec<T>>;

    /// Asynchronous copy of the first `len` elements of `src` into `dst` on `stream`.
    ///
    /// # Safety
    /// `dst` must stay alive and must not be read or written by the host until an event
    /// recorded on `stream` after this call has been synchronized.
    unsafe fn copy_to_host_async<T: GramScalar>(
        &self,
        dst: &mut Self::Pinned<T>,
        src: &Self::Buffer<T>,
        len: usize,
        stream: &Self::Stream,
    ) -> Result<()>;

    fn create_blas_handle(&self) -> Result<Self::BlasHandle>;

    /// Bind `handle` to `stream`, or back to the default stream with `None`.
    fn set_blas_stream(&self, handle: &mut Self::BlasHandle, stream: Option<&Self::Stream>) -> Result<()>;

    /// Issue a GEMM writing `c` on the stream `handle` is bound to.
    fn gemm<T: GramScalar>(
        &self,
        handle: &Self::BlasHandle,
        op: GemmOp<'_, Self::Buffer<T>, T>,
        c: &mut Self::Buffer<T>,
    ) -> Result<()>;
}
