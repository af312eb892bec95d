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


//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;

use xtx_core::comm::SimDeviceCollective;
use xtx_core::{
    DenseGramAssembler, DeviceRuntime, LocalCommunicator, OwnedGramBlock, PipelineSummary, ReductionBackend,
    ReductionPath, Result, SimDevice, compute_distributed_gram_blocks, reference_gram,
};

/// Run `f` once per rank of a fresh group, each on its own thread; results in rank order.
pub fn run_ranks<F, R>(nprocs: usize, f: F) -> Vec<R>
where
    F: Fn(LocalCommunicator) -> R + Send + Sync + 'static,
    R: Send + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = LocalCommunicator::group(nprocs)
        .unwrap()
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            thread::spawn(move || f(comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// Deterministic local matrix; quarter-integer entries keep every sum exact.
pub fn local_matrix(rank: usize, m: usize, n: usize) -> Vec<f64> {
    (0..m * n)
        .map(|idx| {
            let (i, j) = (idx / n, idx % n);
            (((rank * 31 + i * 7 + j * 3) % 11) as f64 - 5.0) / 4.0
        })
        .collect()
}

/// Sum of the per-rank reference Gram matrices (row-major `n x n`).
pub fn global_reference(locals: &[(Vec<f64>, usize)], n: usize) -> Vec<f64> {
    let mut total = vec![0.0; n * n];
    for (x, m) in locals {
        for (acc, v) in total.iter_mut().zip(reference_gram(x, *m, n).unwrap()) {
            *acc += v;
        }
    }
    total
}

/// Run the pipeline on `device` and collect owned copies of every delivered block.
#[allow(clippy::too_many_arguments)]
pub fn collect_blocks(
    device: &SimDevice,
    comm: &LocalCommunicator,
    x_host: &[f64],
    m: usize,
    n: usize,
    block_size: usize,
    path: ReductionPath,
) -> Result<(PipelineSummary, Vec<OwnedGramBlock<f64>>)> {
    let collective = match path {
        ReductionPath::DeviceDirect => Some(SimDeviceCollective::init(comm)?),
        _ => None,
    };
    let reduction = ReductionBackend::<SimDevice, f64>::select(
        path,
        collective
            .as_ref()
            .map(|c| c as &dyn xtx_core::DeviceCollective<SimDevice, f64>),
    )?;
    let x = device.alloc_from_host(x_host)?;
    let mut handle = device.create_blas_handle()?;
    let mut blocks = Vec::new();
    let summary = compute_distributed_gram_blocks(
        device,
        &x,
        m,
        n,
        block_size,
        &mut handle,
        comm,
        &reduction,
        |block| {
            blocks.push(block.to_owned());
            Ok(())
        },
    )?;
    Ok((summary, blocks))
}

/// Dense symmetric matrix assembled from delivered blocks.
pub fn assemble(n: usize, blocks: &[OwnedGramBlock<f64>]) -> Vec<f64> {
    let mut assembler = DenseGramAssembler::new(n);
    for block in blocks {
        assembler.absorb(&block.as_block()).unwrap();
    }
    assembler.into_matrix()
}

pub fn assert_matrix_eq(actual: &[f64], expected: &[f64]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        approx::assert_relative_eq!(*a, *e, epsilon = 1e-10, max_relative = 1e-12);
    }
}
