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


// Double-buffered Gram block pipeline
//
// Overlaps the GEMM of block k+1 on the compute stream with the reduction and
// device-to-host copy of block k on the data-move stream. The host thread is
// the only scheduler; it blocks on per-block events and never issues work into
// a buffer slot that another stream may still be using.

use crate::block::{BlockPlan, BlockSpec, GramBlock};
use crate::comm::HostCollective;
use crate::device::{DeviceBuffer, DeviceRuntime, GemmOp, PinnedBuffer, Transpose};
use crate::error::{GramError, Result};
use crate::reduction::{ReductionBackend, ReductionPath};
use crate::types::GramScalar;

/// Dual-stream context with per-block compute and copy events.
///
/// Owns both streams, the binding of the BLAS handle to the compute stream and
/// one compute-done and one copy-done event per block. Teardown runs in the
/// order handle detach, events, streams: explicitly through
/// [`PipelineContext::release`], or from `Drop` on any other exit path.
pub struct PipelineContext<'a, R: DeviceRuntime> {
    runtime: &'a R,
    handle: &'a mut R::BlasHandle,
    handle_bound: bool,
    stream_compute: Option<R::Stream>,
    stream_data_move: Option<R::Stream>,
    events_compute_done: Vec<R::Event>,
    events_copy_done: Vec<R::Event>,
}

fn validate_event_slot<E>(events: &[E], slot: usize) -> Result<()> {
    if slot >= events.len() {
        return Err(GramError::Precondition(format!(
            "Event slot {} out of range (max: {})",
            slot,
            events.len().saturating_sub(1)
        )));
    }
    Ok(())
}

impl<'a, R: DeviceRuntime> PipelineContext<'a, R> {
    /// Create both streams, bind `handle` to the compute stream and create
    /// `event_slots` compute/copy event pairs. A failure releases whatever was
    /// already created.
    pub fn new(runtime: &'a R, handle: &'a mut R::BlasHandle, event_slots: usize) -> Result<Self> {
        let mut ctx = Self {
            runtime,
            handle,
            handle_bound: false,
            stream_compute: None,
            stream_data_move: None,
            events_compute_done: Vec::with_capacity(event_slots),
            events_copy_done: Vec::with_capacity(event_slots),
        };

        ctx.stream_compute = Some(runtime.create_stream()?);
        ctx.stream_data_move = Some(runtime.create_stream()?);

        if let Some(stream) = ctx.stream_compute.as_ref() {
            runtime.set_blas_stream(&mut *ctx.handle, Some(stream))?;
            ctx.handle_bound = true;
        }

        for _ in 0..event_slots {
            ctx.events_compute_done.push(runtime.create_event()?);
            ctx.events_copy_done.push(runtime.create_event()?);
        }
        Ok(ctx)
    }

    pub fn runtime(&self) -> &'a R {
        self.runtime
    }

    /// BLAS handle, bound to the compute stream while the context is live.
    pub fn handle(&self) -> &R::BlasHandle {
        &*self.handle
    }

    pub fn stream_compute(&self) -> Result<&R::Stream> {
        self.stream_compute
            .as_ref()
            .ok_or_else(|| GramError::DeviceResource("Compute stream already released".to_string()))
    }

    pub fn stream_data_move(&self) -> Result<&R::Stream> {
        self.stream_data_move
            .as_ref()
            .ok_or_else(|| GramError::DeviceResource("Data-move stream already released".to_string()))
    }

    pub fn event_slots(&self) -> usize {
        self.events_compute_done.len()
    }

    /// Record completion of the GEMM for block `slot` on the compute stream.
    pub fn record_compute_done(&self, slot: usize) -> Result<()> {
        crate::profile_scope!("GPU::ComputeEventRecord");
        validate_event_slot(&self.events_compute_done, slot)?;
        self.runtime
            .record_event(&self.events_compute_done[slot], self.stream_compute()?)
    }

    /// Record completion of the reduction/copy for block `slot` on the data-move stream.
    pub fn record_copy_done(&self, slot: usize) -> Result<()> {
        crate::profile_scope!("GPU::CopyEventRecord");
        validate_event_slot(&self.events_copy_done, slot)?;
        self.runtime
            .record_event(&self.events_copy_done[slot], self.stream_data_move()?)
    }

    /// Host waits until the GEMM of block `slot` has finished.
    pub fn synchronize_compute_done(&self, slot: usize) -> Result<()> {
        crate::profile_scope!("Pipeline::SyncComputeEvent");
        validate_event_slot(&self.events_compute_done, slot)?;
        self.runtime
            .synchronize_event(&self.events_compute_done[slot])
    }

    /// Host waits until the copy of block `slot` has landed in host memory.
    pub fn synchronize_copy_done(&self, slot: usize) -> Result<()> {
        crate::profile_scope!("Pipeline::SyncCopyEvent");
        validate_event_slot(&self.events_copy_done, slot)?;
        self.runtime.synchronize_event(&self.events_copy_done[slot])
    }

    /// Tear down and report the first failure.
    pub fn release(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        crate::profile_scope!("Pipeline::Teardown");
        let mut first_error = None;

        if self.handle_bound {
            self.handle_bound = false;
            if let Err(e) = self.runtime.set_blas_stream(&mut *self.handle, None) {
                first_error.get_or_insert(e);
            }
        }

        let mut events: Vec<R::Event> = self.events_compute_done.drain(..).collect();
        events.extend(self.events_copy_done.drain(..));
        for event in events {
            if let Err(e) = self.runtime.destroy_event(event) {
                first_error.get_or_insert(e);
            }
        }

        for stream in [self.stream_compute.take(), self.stream_data_move.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.runtime.destroy_stream(stream) {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl<R: DeviceRuntime> Drop for PipelineContext<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::warn!("PipelineContext teardown failed: {}", e);
        }
    }
}

/// Two device slots with an explicit active-slot index.
///
/// `swap` re-points "current" and "next"; no data moves.
pub struct PingPong<B> {
    slots: [B; 2],
    current: usize,
}

impl<B> PingPong<B> {
    pub fn new(first: B, second: B) -> Self {
        Self {
            slots: [first, second],
            current: 0,
        }
    }

    pub fn current(&self) -> &B {
        &self.slots[self.current]
    }

    pub fn current_mut(&mut self) -> &mut B {
        &mut self.slots[self.current]
    }

    pub fn next(&self) -> &B {
        &self.slots[self.current ^ 1]
    }

    pub fn next_mut(&mut self) -> &mut B {
        &mut self.slots[self.current ^ 1]
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn swap(&mut self) {
        self.current ^= 1;
    }
}

/// What one pipeline call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineSummary {
    pub blocks: usize,
    pub block_size: usize,
    pub reduction: ReductionPath,
    /// Sum of `D * B` over all blocks
    pub elements: usize,
}

fn issue_block_gemm<R: DeviceRuntime, T: GramScalar>(
    runtime: &R,
    handle: &R::BlasHandle,
    x: &R::Buffer<T>,
    m: usize,
    n: usize,
    spec: &BlockSpec,
    target: &mut R::Buffer<T>,
) -> Result<()> {
    crate::profile_scope!("GPU::BlockGemm");
    // block = X[:, ivec..]^T * X[:, ivec..ivec+B], written column-major with ld = D
    let op = GemmOp {
        trans_a: Transpose::None,
        trans_b: Transpose::Transpose,
        m: spec.rows,
        n: spec.cols,
        k: m,
        alpha: T::one(),
        a: x,
        a_offset: spec.offset,
        lda: n,
        b: x,
        b_offset: spec.offset,
        ldb: n,
        beta: T::zero(),
        ldc: spec.rows,
    };
    runtime.gemm(handle, op, target)
}

/// Compute the globally reduced Gram blocks of a distributed matrix.
///
/// `x` is the local `m x n` matrix on the device, stored with the `n` vectors
/// as the fast index. Blocks are handed to `consumer` one at a time in
/// increasing offset order; the borrowed tile is only valid during the call.
/// An error from any device call, collective or the consumer aborts the call
/// after releasing streams and events.
///
/// Errors:
/// - `Precondition` when `block_size` is zero or does not divide `n`, or `x`
///   holds fewer than `m * n` elements; raised before any device work.
/// - `DeviceResource` / `DeviceOperation` / `MemoryAllocation` from the runtime.
/// - `Collective` from either reduction path.
#[allow(clippy::too_many_arguments)]
pub fn compute_distributed_gram_blocks<R, T, C, F>(
    runtime: &R,
    x: &R::Buffer<T>,
    m: usize,
    n: usize,
    block_size: usize,
    handle: &mut R::BlasHandle,
    comm: &C,
    reduction: &ReductionBackend<'_, R, T>,
    mut consumer: F,
) -> Result<PipelineSummary>
where
    R: DeviceRuntime,
    T: GramScalar,
    C: HostCollective,
    F: FnMut(GramBlock<'_, T>) -> Result<()>,
{
    crate::profile_scope!("Pipeline::GramBlocks");
    let plan = BlockPlan::new(n, block_size)?;
    let required = m.checked_mul(n).ok_or_else(|| {
        GramError::Precondition(format!("Local matrix {} x {} overflows usize", m, n))
    })?;
    if x.len() < required {
        return Err(GramError::Precondition(format!(
            "Local matrix holds {} elements, expected at least {} ({} x {})",
            x.len(),
            required,
            m,
            n
        )));
    }

    let mut summary = PipelineSummary {
        blocks: 0,
        block_size,
        reduction: reduction.path(),
        elements: 0,
    };
    if plan.is_empty() {
        return Ok(summary);
    }

    log::info!(
        "Gram pipeline on {}: m={} n={} block_size={} blocks={} reduction={} type={}",
        runtime.name(),
        m,
        n,
        block_size,
        plan.len(),
        summary.reduction,
        T::TYPE_NAME
    );

    // Declared before the context so that the streams writing into them are
    // torn down first on every exit path.
    let max_len = plan.max_block_len();
    let mut staging = runtime.alloc_pinned(max_len, T::zero())?;
    let mut slots = PingPong::new(
        runtime.alloc(max_len, T::zero())?,
        runtime.alloc(max_len, T::zero())?,
    );
    let ctx = PipelineContext::new(runtime, handle, plan.len())?;

    match run_blocks(
        &ctx,
        x,
        m,
        n,
        &plan,
        &mut slots,
        &mut staging,
        comm,
        reduction,
        &mut consumer,
    ) {
        Ok(elements) => {
            summary.blocks = plan.len();
            summary.elements = elements;
        }
        Err(e) => {
            log::error!("Gram pipeline aborted ({}): {}", e.kind(), e);
            return Err(e);
        }
    }

    ctx.release()?;
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
fn run_blocks<R, T, C, F>(
    ctx: &PipelineContext<'_, R>,
    x: &R::Buffer<T>,
    m: usize,
    n: usize,
    plan: &BlockPlan,
    slots: &mut PingPong<R::Buffer<T>>,
    staging: &mut R::Pinned<T>,
    comm: &C,
    reduction: &ReductionBackend<'_, R, T>,
    consumer: &mut F,
) -> Result<usize>
where
    R: DeviceRuntime,
    T: GramScalar,
    C: HostCollective,
    F: FnMut(GramBlock<'_, T>) -> Result<()>,
{
    let runtime = ctx.runtime();
    let mut elements = 0;

    if let Some(first) = plan.get(0) {
        issue_block_gemm(runtime, ctx.handle(), x, m, n, first, slots.current_mut())?;
        ctx.record_compute_done(first.index)?;
    }

    for spec in plan.iter() {
        let k = spec.index;

        // A failed wait is an error, never a silently skipped swap.
        ctx.synchronize_compute_done(k)?;
        if k > 0 {
            slots.swap();
        }

        // Overlap: block k+1 multiplies while block k is reduced and copied.
        if let Some(next) = plan.get(k + 1) {
            issue_block_gemm(runtime, ctx.handle(), x, m, n, next, slots.next_mut())?;
            ctx.record_compute_done(next.index)?;
        }

        let len = spec.len();
        if let ReductionBackend::DeviceDirect(collective) = reduction {
            crate::profile_scope!("Collective::DeviceDirect");
            collective.all_reduce_sum_in_place(runtime, slots.current(), len, ctx.stream_data_move()?)?;
        }

        {
            crate::profile_scope!("GPU::D2H_Copy");
            // Safety: `staging` outlives the context and is not touched by the
            // host until the copy event below has been synchronized.
            unsafe {
                runtime.copy_to_host_async(staging, slots.current(), len, ctx.stream_data_move()?)?;
            }
        }
        ctx.record_copy_done(k)?;
        ctx.synchronize_copy_done(k)?;

        let tile = &mut staging.as_mut_slice()[..len];
        if let ReductionBackend::HostStaged = reduction {
            crate::profile_scope!("Collective::HostStaged");
            comm.all_reduce_sum_in_place(tile)?;
        }

        consumer(GramBlock {
            spec: *spec,
            data: tile,
        })?;
        elements += len;
        log::debug!(
            "Block {} done: offset={} rows={} cols={}",
            k,
            spec.offset,
            spec.rows,
            spec.cols
        );
    }

    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{FaultPoint, SimDevice, TraceEvent};

    #[test]
    fn validate_event_slot_allows_in_range() {
        let events = vec![(); 2];
        assert!(validate_event_slot(&events, 0).is_ok());
        assert!(validate_event_slot(&events, 1).is_ok());
    }

    #[test]
    fn validate_event_slot_rejects_out_of_range() {
        let events = vec![(); 2];
        let err = validate_event_slot(&events, 2).unwrap_err();
        assert!(matches!(err, GramError::Precondition(_)));
    }

    #[test]
    fn ping_pong_swaps_labels_only() {
        let mut pp = PingPong::new("a", "b");
        assert_eq!((*pp.current(), *pp.next()), ("a", "b"));
        pp.swap();
        assert_eq!((*pp.current(), *pp.next()), ("b", "a"));
        assert_eq!(pp.current_index(), 1);
        *pp.next_mut() = "c";
        pp.swap();
        assert_eq!(*pp.current(), "c");
    }

    #[test]
    fn release_tears_down_in_order() {
        let device = SimDevice::new();
        let mut handle = device.create_blas_handle().unwrap();
        let ctx = PipelineContext::new(&device, &mut handle, 3).unwrap();
        assert_eq!(ctx.event_slots(), 3);
        assert_eq!(device.live_streams(), 2);
        assert_eq!(device.live_events(), 6);
        device.clear_trace();
        ctx.release().unwrap();

        assert_eq!(device.live_streams(), 0);
        assert_eq!(device.live_events(), 0);
        assert!(handle.bound_stream().is_none());

        let trace = device.trace();
        let detach = trace
            .iter()
            .position(|e| *e == TraceEvent::BlasStreamSet { stream: None })
            .unwrap();
        let first_event = trace
            .iter()
            .position(|e| matches!(e, TraceEvent::EventDestroyed { .. }))
            .unwrap();
        let last_event = trace
            .iter()
            .rposition(|e| matches!(e, TraceEvent::EventDestroyed { .. }))
            .unwrap();
        let first_stream = trace
            .iter()
            .position(|e| matches!(e, TraceEvent::StreamDestroyed { .. }))
            .unwrap();
        assert!(detach < first_event);
        assert!(last_event < first_stream);
    }

    #[test]
    fn partial_construction_is_released() {
        // fail on the fourth event: two pairs minus one already exist
        let device = SimDevice::builder()
            .fail_at(FaultPoint::CreateEvent, 3)
            .build();
        let mut handle = device.create_blas_handle().unwrap();
        let err = PipelineContext::new(&device, &mut handle, 4).err().unwrap();
        assert!(matches!(err, GramError::DeviceResource(_)));
        assert_eq!(device.live_streams(), 0);
        assert_eq!(device.live_events(), 0);
        assert!(handle.bound_stream().is_none());
    }

    #[test]
    fn drop_releases_like_release() {
        let device = SimDevice::new();
        let mut handle = device.create_blas_handle().unwrap();
        {
            let ctx = PipelineContext::new(&device, &mut handle, 2).unwrap();
            ctx.record_compute_done(0).unwrap();
            ctx.synchronize_compute_done(0).unwrap();
        }
        assert_eq!(device.live_streams(), 0);
        assert_eq!(device.live_events(), 0);
    }

    #[test]
    fn record_on_unknown_slot_is_rejected() {
        let device = SimDevice::new();
        let mut handle = device.create_blas_handle().unwrap();
        let ctx = PipelineContext::new(&device, &mut handle, 1).unwrap();
        assert!(ctx.record_copy_done(1).is_err());
        assert!(ctx.synchronize_compute_done(5).is_err());
    }
}
