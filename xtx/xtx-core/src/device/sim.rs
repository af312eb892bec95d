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


//! Host-memory simulation of an accelerator runtime.
//!
//! Each stream is a dedicated worker thread draining an ordered queue, so work
//! within a stream runs in issue order while separate streams run concurrently
//! with each other and with the host. Events are generation-counted markers
//! pushed through a stream's queue. Failures inside queued work are sticky on
//! their stream and surface from the next event or stream synchronisation.
//!
//! The simulator also keeps an issue trace and live stream/event counters, and
//! can inject faults at chosen call sites, which is what the pipeline tests use
//! to check ordering, buffer rotation and release on every exit path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rayon::prelude::*;

use super::{DeviceBuffer, DeviceRuntime, GemmOp, PinnedBuffer, Transpose};
use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// Call sites where the simulator can inject a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateStream,
    DestroyStream,
    CreateEvent,
    DestroyEvent,
    RecordEvent,
    SynchronizeEvent,
    Alloc,
    /// GEMM rejected at issue time
    GemmLaunch,
    /// GEMM accepted but fails while executing on its stream
    GemmExecution,
    CopyLaunch,
    BlasSetStream,
}

impl FaultPoint {
    fn error(self, occurrence: usize) -> GramError {
        let msg = format!("simulated fault at {:?} #{}", self, occurrence);
        match self {
            FaultPoint::CreateStream
            | FaultPoint::DestroyStream
            | FaultPoint::CreateEvent
            | FaultPoint::DestroyEvent
            | FaultPoint::BlasSetStream => GramError::DeviceResource(msg),
            FaultPoint::Alloc => GramError::MemoryAllocation(msg),
            FaultPoint::RecordEvent
            | FaultPoint::SynchronizeEvent
            | FaultPoint::GemmLaunch
            | FaultPoint::GemmExecution
            | FaultPoint::CopyLaunch => GramError::DeviceOperation(msg),
        }
    }
}

/// One entry of the simulator's issue trace, in host issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    StreamCreated { stream: usize },
    StreamDestroyed { stream: usize },
    EventCreated { event: usize },
    EventDestroyed { event: usize },
    EventRecorded { event: usize, stream: usize },
    EventSynchronized { event: usize },
    BlasStreamSet { stream: Option<usize> },
    Gemm {
        stream: Option<usize>,
        target: usize,
        rows: usize,
        cols: usize,
    },
    CopyToHost { stream: usize, source: usize, len: usize },
    Collective { stream: usize, buffer: usize, len: usize },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct FaultPlan {
    rules: Vec<(FaultPoint, usize)>,
    seen: HashMap<FaultPoint, usize>,
}

impl FaultPlan {
    /// Count one occurrence of `point`; returns the occurrence index if it must fail.
    fn hit(&mut self, point: FaultPoint) -> Option<usize> {
        let count = self.seen.entry(point).or_insert(0);
        let current = *count;
        *count += 1;
        self.rules
            .iter()
            .any(|&(p, nth)| p == point && nth == current)
            .then_some(current)
    }
}

struct SimShared {
    compute_latency: Duration,
    copy_latency: Duration,
    next_id: AtomicUsize,
    live_streams: AtomicUsize,
    live_events: AtomicUsize,
    faults: Mutex<FaultPlan>,
    trace: Mutex<Vec<TraceEvent>>,
    streams: Mutex<HashMap<usize, Weak<StreamQueue>>>,
}

impl SimShared {
    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn check(&self, point: FaultPoint) -> Result<()> {
        match lock(&self.faults).hit(point) {
            Some(occurrence) => {
                log::debug!("SimDevice: injecting fault at {:?} #{}", point, occurrence);
                Err(point.error(occurrence))
            }
            None => Ok(()),
        }
    }

    fn trace(&self, event: TraceEvent) {
        lock(&self.trace).push(event);
    }
}

type StreamOp = Box<dyn FnOnce() -> Result<()> + Send>;

enum StreamWork {
    Op(StreamOp),
    Marker {
        event: Arc<EventState>,
        generation: u64,
    },
}

struct StreamQueue {
    id: usize,
    tx: Sender<StreamWork>,
}

impl StreamQueue {
    fn submit(&self, work: StreamWork) -> Result<()> {
        self.tx.send(work).map_err(|_| {
            GramError::DeviceOperation(format!("stream {} is no longer accepting work", self.id))
        })
    }

    /// Push a fresh marker and block until the worker reaches it.
    fn drain(&self) -> Result<()> {
        let marker = Arc::new(EventState::default());
        let generation = marker.arm();
        self.submit(StreamWork::Marker {
            event: marker.clone(),
            generation,
        })?;
        marker.wait()
    }
}

fn stream_worker(id: usize, rx: Receiver<StreamWork>) {
    let mut fault: Option<GramError> = None;
    while let Ok(work) = rx.recv() {
        match work {
            StreamWork::Op(op) => {
                if fault.is_some() {
                    continue;
                }
                if let Err(e) = op() {
                    log::debug!("SimDevice stream {}: operation failed: {}", id, e);
                    fault = Some(e);
                }
            }
            StreamWork::Marker { event, generation } => event.complete(generation, fault.clone()),
        }
    }
}

#[derive(Default)]
struct EventStatus {
    recorded: u64,
    completed: u64,
    fault: Option<GramError>,
}

#[derive(Default)]
struct EventState {
    status: Mutex<EventStatus>,
    signal: Condvar,
}

impl EventState {
    fn arm(&self) -> u64 {
        let mut status = lock(&self.status);
        status.recorded += 1;
        status.recorded
    }

    fn complete(&self, generation: u64, fault: Option<GramError>) {
        let mut status = lock(&self.status);
        if generation > status.completed {
            status.completed = generation;
            status.fault = fault;
        }
        self.signal.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut status = lock(&self.status);
        while status.completed < status.recorded {
            status = self
                .signal
                .wait(status)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match &status.fault {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

/// Ordered work queue served by its own worker thread.
pub struct SimStream {
    id: usize,
    queue: Option<Arc<StreamQueue>>,
    worker: Option<thread::JoinHandle<()>>,
    shared: Arc<SimShared>,
}

impl SimStream {
    pub fn id(&self) -> usize {
        self.id
    }

    fn queue(&self) -> Result<&Arc<StreamQueue>> {
        self.queue
            .as_ref()
            .ok_or_else(|| GramError::DeviceOperation(format!("stream {} already destroyed", self.id)))
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        lock(&self.shared.streams).remove(&self.id);
        // Closing the channel lets the worker finish queued work and exit.
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("SimDevice stream {}: worker panicked", self.id);
            }
        }
        self.shared.live_streams.fetch_sub(1, Ordering::SeqCst);
        self.shared.trace(TraceEvent::StreamDestroyed { stream: self.id });
    }
}

/// Host-awaitable completion marker.
pub struct SimEvent {
    id: usize,
    state: Arc<EventState>,
    shared: Arc<SimShared>,
}

impl SimEvent {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SimEvent {
    fn drop(&mut self) {
        self.shared.live_events.fetch_sub(1, Ordering::SeqCst);
        self.shared.trace(TraceEvent::EventDestroyed { event: self.id });
    }
}

/// Simulated device memory.
pub struct SimBuffer<T> {
    id: usize,
    len: usize,
    pub(crate) data: Arc<Mutex<Vec<T>>>,
}

impl<T> SimBuffer<T> {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl<T> DeviceBuffer<T> for SimBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }
}

/// Simulated pinned host memory. The heap block never moves while the buffer lives.
pub struct SimPinned<T> {
    data: Box<[T]>,
}

impl<T> PinnedBuffer<T> for SimPinned<T> {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn as_mut_ptr(&mut self) -> *mut T {
        self.data.as_mut_ptr()
    }
}

/// BLAS handle; remembers the stream it is bound to without keeping it alive.
#[derive(Default)]
pub struct SimBlasHandle {
    stream: Option<Weak<StreamQueue>>,
    stream_id: Option<usize>,
}

impl SimBlasHandle {
    pub fn bound_stream(&self) -> Option<usize> {
        self.stream_id
    }
}

/// Raw pointer handed to a stream worker for writes into pinned host memory.
/// Safety: the pipeline keeps the target alive and untouched until the copy event completes.
struct SendPtr<T>(*mut T);
unsafe impl<T: Send> Send for SendPtr<T> {}

impl<T> SendPtr<T> {
    /// # Safety
    /// The pointer must be valid for `len` writes and not aliased for the returned lifetime.
    unsafe fn slice_mut<'a>(&self, len: usize) -> &'a mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.0, len) }
    }
}

#[derive(Clone, Copy)]
struct GemmDesc<T> {
    trans_a: Transpose,
    trans_b: Transpose,
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a_offset: usize,
    lda: usize,
    b_offset: usize,
    ldb: usize,
    beta: T,
    ldc: usize,
}

/// Column-major GEMM on host slices, parallel over output columns.
fn gemm_kernel<T: GramScalar>(desc: GemmDesc<T>, a: &[T], b: &[T], c: &mut [T]) {
    if desc.m == 0 || desc.n == 0 {
        return;
    }
    let op_a = |i: usize, l: usize| match desc.trans_a {
        Transpose::None => a[desc.a_offset + i + l * desc.lda],
        Transpose::Transpose => a[desc.a_offset + l + i * desc.lda],
    };
    let op_b = |l: usize, j: usize| match desc.trans_b {
        Transpose::None => b[desc.b_offset + l + j * desc.ldb],
        Transpose::Transpose => b[desc.b_offset + j + l * desc.ldb],
    };
    c.par_chunks_mut(desc.ldc)
        .take(desc.n)
        .enumerate()
        .for_each(|(j, column)| {
            for (i, out) in column.iter_mut().take(desc.m).enumerate() {
                let dot = (0..desc.k).map(|l| op_a(i, l) * op_b(l, j)).sum::<T>();
                *out = if desc.beta == T::zero() {
                    desc.alpha * dot
                } else {
                    desc.alpha * dot + desc.beta * *out
                };
            }
        });
}

/// Builder for [`SimDevice`].
#[derive(Default)]
pub struct SimDeviceBuilder {
    compute_latency: Duration,
    copy_latency: Duration,
    faults: Vec<(FaultPoint, usize)>,
}

impl SimDeviceBuilder {
    /// Extra time every GEMM spends on its stream.
    pub fn compute_latency(mut self, latency: Duration) -> Self {
        self.compute_latency = latency;
        self
    }

    /// Extra time every device-to-host copy spends on its stream.
    pub fn copy_latency(mut self, latency: Duration) -> Self {
        self.copy_latency = latency;
        self
    }

    /// Fail the `nth` (0-based) call at `point`.
    pub fn fail_at(mut self, point: FaultPoint, nth: usize) -> Self {
        self.faults.push((point, nth));
        self
    }

    pub fn build(self) -> SimDevice {
        SimDevice {
            shared: Arc::new(SimShared {
                compute_latency: self.compute_latency,
                copy_latency: self.copy_latency,
                next_id: AtomicUsize::new(0),
                live_streams: AtomicUsize::new(0),
                live_events: AtomicUsize::new(0),
                faults: Mutex::new(FaultPlan {
                    rules: self.faults,
                    seen: HashMap::new(),
                }),
                trace: Mutex::new(Vec::new()),
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Accelerator runtime simulated in host memory.
#[derive(Clone)]
pub struct SimDevice {
    shared: Arc<SimShared>,
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDevice {
    pub fn new() -> Self {
        SimDeviceBuilder::default().build()
    }

    pub fn builder() -> SimDeviceBuilder {
        SimDeviceBuilder::default()
    }

    /// Issue trace since creation or the last [`SimDevice::clear_trace`].
    pub fn trace(&self) -> Vec<TraceEvent> {
        lock(&self.shared.trace).clone()
    }

    pub fn clear_trace(&self) {
        lock(&self.shared.trace).clear();
    }

    pub fn live_streams(&self) -> usize {
        self.shared.live_streams.load(Ordering::SeqCst)
    }

    pub fn live_events(&self) -> usize {
        self.shared.live_events.load(Ordering::SeqCst)
    }

    /// Queue `op` on `stream`, recording `event` in the trace.
    pub(crate) fn launch<F>(&self, stream: &SimStream, event: TraceEvent, op: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let queue = stream.queue()?;
        self.shared.trace(event);
        queue.submit(StreamWork::Op(Box::new(op)))
    }
}

impl DeviceRuntime for SimDevice {
    type Stream = SimStream;
    type Event = SimEvent;
    type Buffer<T: GramScalar> = SimBuffer<T>;
    type Pinned<T: GramScalar> = SimPinned<T>;
    type BlasHandle = SimBlasHandle;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn create_stream(&self) -> Result<SimStream> {
        self.shared.check(FaultPoint::CreateStream)?;
        let id = self.shared.next_id();
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name(format!("xtx-sim-stream-{}", id))
            .spawn(move || stream_worker(id, rx))
            .map_err(|e| GramError::DeviceResource(format!("Failed to spawn stream worker: {}", e)))?;
        let queue = Arc::new(StreamQueue { id, tx });
        lock(&self.shared.streams).insert(id, Arc::downgrade(&queue));
        self.shared.live_streams.fetch_add(1, Ordering::SeqCst);
        self.shared.trace(TraceEvent::StreamCreated { stream: id });
        Ok(SimStream {
            id,
            queue: Some(queue),
            worker: Some(worker),
            shared: self.shared.clone(),
        })
    }

    fn destroy_stream(&self, stream: SimStream) -> Result<()> {
        let result = self.shared.check(FaultPoint::DestroyStream);
        drop(stream);
        result
    }

    fn synchronize_stream(&self, stream: &SimStream) -> Result<()> {
        stream.queue()?.drain()
    }

    fn create_event(&self) -> Result<SimEvent> {
        self.shared.check(FaultPoint::CreateEvent)?;
        let id = self.shared.next_id();
        self.shared.live_events.fetch_add(1, Ordering::SeqCst);
        self.shared.trace(TraceEvent::EventCreated { event: id });
        Ok(SimEvent {
            id,
            state: Arc::new(EventState::default()),
            shared: self.shared.clone(),
        })
    }

    fn destroy_event(&self, event: SimEvent) -> Result<()> {
        let result = self.shared.check(FaultPoint::DestroyEvent);
        drop(event);
        result
    }

    fn record_event(&self, event: &SimEvent, stream: &SimStream) -> Result<()> {
        self.shared.check(FaultPoint::RecordEvent)?;
        let queue = stream.queue()?;
        let generation = event.state.arm();
        self.shared.trace(TraceEvent::EventRecorded {
            event: event.id,
            stream: stream.id,
        });
        queue.submit(StreamWork::Marker {
            event: event.state.clone(),
            generation,
        })
    }

    fn synchronize_event(&self, event: &SimEvent) -> Result<()> {
        self.shared.check(FaultPoint::SynchronizeEvent)?;
        self.shared
            .trace(TraceEvent::EventSynchronized { event: event.id });
        event.state.wait()
    }

    fn synchronize(&self) -> Result<()> {
        let queues: Vec<Arc<StreamQueue>> = lock(&self.shared.streams)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        let mut first_error = None;
        for queue in queues {
            if let Err(e) = queue.drain() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn alloc<T: GramScalar>(&self, len: usize, fill: T) -> Result<SimBuffer<T>> {
        self.shared.check(FaultPoint::Alloc)?;
        Ok(SimBuffer {
            id: self.shared.next_id(),
            len,
            data: Arc::new(Mutex::new(vec![fill; len])),
        })
    }

    fn alloc_from_host<T: GramScalar>(&self, data: &[T]) -> Result<SimBuffer<T>> {
        self.shared.check(FaultPoint::Alloc)?;
        Ok(SimBuffer {
            id: self.shared.next_id(),
            len: data.len(),
            data: Arc::new(Mutex::new(data.to_vec())),
        })
    }

    fn alloc_pinned<T: GramScalar>(&self, len: usize, fill: T) -> Result<SimPinned<T>> {
        self.shared.check(FaultPoint::Alloc)?;
        Ok(SimPinned {
            data: vec![fill; len].into_boxed_slice(),
        })
    }

    fn copy_to_vec<T: GramScalar>(&self, src: &SimBuffer<T>) -> Result<Vec<T>> {
        self.synchronize()?;
        Ok(lock(&src.data).clone())
    }

    unsafe fn copy_to_host_async<T: GramScalar>(
        &self,
        dst: &mut SimPinned<T>,
        src: &SimBuffer<T>,
        len: usize,
        stream: &SimStream,
    ) -> Result<()> {
        self.shared.check(FaultPoint::CopyLaunch)?;
        if len > src.len || len > dst.len() {
            return Err(GramError::DeviceOperation(format!(
                "Copy of {} elements exceeds source ({}) or destination ({})",
                len,
                src.len,
                dst.len()
            )));
        }
        let target = SendPtr(dst.as_mut_ptr());
        let source = src.data.clone();
        let latency = self.shared.copy_latency;
        self.launch(
            stream,
            TraceEvent::CopyToHost {
                stream: stream.id,
                source: src.id,
                len,
            },
            move || {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                let source = lock(&source);
                let out = unsafe { target.slice_mut(len) };
                out.copy_from_slice(&source[..len]);
                Ok(())
            },
        )
    }

    fn create_blas_handle(&self) -> Result<SimBlasHandle> {
        Ok(SimBlasHandle::default())
    }

    fn set_blas_stream(&self, handle: &mut SimBlasHandle, stream: Option<&SimStream>) -> Result<()> {
        self.shared.check(FaultPoint::BlasSetStream)?;
        match stream {
            Some(s) => {
                handle.stream = Some(Arc::downgrade(s.queue()?));
                handle.stream_id = Some(s.id);
            }
            None => {
                handle.stream = None;
                handle.stream_id = None;
            }
        }
        self.shared.trace(TraceEvent::BlasStreamSet {
            stream: handle.stream_id,
        });
        Ok(())
    }

    fn gemm<T: GramScalar>(
        &self,
        handle: &SimBlasHandle,
        op: GemmOp<'_, SimBuffer<T>, T>,
        c: &mut SimBuffer<T>,
    ) -> Result<()> {
        self.shared.check(FaultPoint::GemmLaunch)?;

        op.validate(op.a.len, op.b.len, c.len)?;
        if Arc::ptr_eq(&c.data, &op.a.data) || Arc::ptr_eq(&c.data, &op.b.data) {
            return Err(GramError::DeviceOperation(
                "GEMM output aliases an input".to_string(),
            ));
        }

        let desc = GemmDesc {
            trans_a: op.trans_a,
            trans_b: op.trans_b,
            m: op.m,
            n: op.n,
            k: op.k,
            alpha: op.alpha,
            a_offset: op.a_offset,
            lda: op.lda,
            b_offset: op.b_offset,
            ldb: op.ldb,
            beta: op.beta,
            ldc: op.ldc,
        };
        let a = op.a.data.clone();
        let b = op.b.data.clone();
        let out = c.data.clone();
        let latency = self.shared.compute_latency;
        let execution_fault = self.shared.check(FaultPoint::GemmExecution).err();
        let run = move || -> Result<()> {
            if !latency.is_zero() {
                thread::sleep(latency);
            }
            if let Some(e) = execution_fault {
                return Err(e);
            }
            let a_guard = lock(&a);
            let b_guard;
            let b_slice: &[T] = if Arc::ptr_eq(&a, &b) {
                &a_guard
            } else {
                b_guard = lock(&b);
                &b_guard
            };
            let mut c_guard = lock(&out);
            gemm_kernel(desc, &a_guard, b_slice, &mut c_guard);
            Ok(())
        };

        let trace = TraceEvent::Gemm {
            stream: handle.stream_id,
            target: c.id,
            rows: op.m,
            cols: op.n,
        };
        match &handle.stream {
            Some(weak) => {
                let queue = weak.upgrade().ok_or_else(|| {
                    GramError::DeviceOperation("BLAS handle bound to a destroyed stream".to_string())
                })?;
                self.shared.trace(trace);
                queue.submit(StreamWork::Op(Box::new(run)))
            }
            None => {
                // default stream: ordered after all outstanding work
                self.synchronize()?;
                self.shared.trace(trace);
                run()
            }
        }
    }
}
