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


//! Block decomposition of the overlap matrix.
//!
//! Block `k` starts at vector offset `ivec = k * block_size` and holds the
//! `D x B` tile with `D = N - ivec` rows and `B = min(block_size, N - ivec)`
//! columns: global entries `(ivec + r, ivec + c)` for `r < D`, `c < B`.
//! Tiles are stored column-major with leading dimension `D`, as produced by the
//! device GEMM. Together the tiles cover every entry on or below the block
//! diagonal exactly once, which by symmetry determines the whole matrix.

use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// Geometry of one block of the overlap matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSpec {
    /// Block number, also the index of its compute/copy events
    pub index: usize,
    /// First vector of the block (`ivec`)
    pub offset: usize,
    /// Trailing dimension `D = N - ivec`
    pub rows: usize,
    /// Block width `B = min(block_size, N - ivec)`
    pub cols: usize,
}

impl BlockSpec {
    /// Number of elements in the tile (`D * B`).
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered blocks for one pipeline call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockPlan {
    n: usize,
    block_size: usize,
    blocks: Vec<BlockSpec>,
}

impl BlockPlan {
    /// Plan the blocks of an `n x n` overlap matrix.
    ///
    /// `block_size` must be non-zero and divide `n` evenly.
    pub fn new(n: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(GramError::Precondition(
                "Block size must be greater than zero".to_string(),
            ));
        }
        if n % block_size != 0 {
            return Err(GramError::Precondition(format!(
                "Block size {} does not divide the number of vectors {}",
                block_size, n
            )));
        }

        let blocks = (0..n)
            .step_by(block_size)
            .enumerate()
            .map(|(index, ivec)| BlockSpec {
                index,
                offset: ivec,
                rows: n - ivec,
                cols: block_size.min(n - ivec),
            })
            .collect();

        Ok(Self {
            n,
            block_size,
            blocks,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks (`N / block_size`).
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&BlockSpec> {
        self.blocks.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BlockSpec> {
        self.blocks.iter()
    }

    /// Elements needed by one block buffer; the first block is the largest.
    pub fn max_block_len(&self) -> usize {
        self.blocks.first().map(BlockSpec::len).unwrap_or(0)
    }
}

/// Reduced tile of one block, borrowed from the host staging buffer.
///
/// Only valid until the pipeline issues the next block's copy, so consumers
/// copy out whatever they need to keep.
#[derive(Clone, Copy, Debug)]
pub struct GramBlock<'a, T> {
    pub spec: BlockSpec,
    pub data: &'a [T],
}

impl<'a, T: GramScalar> GramBlock<'a, T> {
    pub fn offset(&self) -> usize {
        self.spec.offset
    }

    pub fn rows(&self) -> usize {
        self.spec.rows
    }

    pub fn cols(&self) -> usize {
        self.spec.cols
    }

    /// Local entry `(r, c)`, i.e. global entry `(offset + r, offset + c)`.
    #[inline]
    pub fn get(&self, r: usize, c: usize) -> T {
        debug_assert!(r < self.spec.rows && c < self.spec.cols);
        self.data[r + c * self.spec.rows]
    }

    pub fn to_owned(&self) -> OwnedGramBlock<T> {
        OwnedGramBlock {
            spec: self.spec,
            data: self.data.to_vec(),
        }
    }
}

/// Owned copy of a reduced tile.
#[derive(Clone, Debug, PartialEq)]
pub struct OwnedGramBlock<T> {
    pub spec: BlockSpec,
    pub data: Vec<T>,
}

impl<T: GramScalar> OwnedGramBlock<T> {
    pub fn as_block(&self) -> GramBlock<'_, T> {
        GramBlock {
            spec: self.spec,
            data: &self.data,
        }
    }
}

/// Reference consumer writing every tile (and its mirror) into a dense matrix.
///
/// Also counts how often each entry of the block-lower-triangular region is
/// written, so tests can check that the tiles neither overlap nor leave gaps.
pub struct DenseGramAssembler<T> {
    n: usize,
    matrix: Vec<T>,
    hits: Vec<u32>,
}

impl<T: GramScalar> DenseGramAssembler<T> {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            matrix: vec![T::zero(); n * n],
            hits: vec![0; n * n],
        }
    }

    /// Write one tile; fails if it reaches outside the matrix.
    pub fn absorb(&mut self, block: &GramBlock<'_, T>) -> Result<()> {
        let spec = block.spec;
        if spec.offset + spec.rows > self.n || spec.offset + spec.cols > self.n {
            return Err(GramError::Precondition(format!(
                "Block {} ({}x{} at {}) exceeds a {}x{} matrix",
                spec.index, spec.rows, spec.cols, spec.offset, self.n, self.n
            )));
        }
        if block.data.len() < spec.len() {
            return Err(GramError::Precondition(format!(
                "Block {} holds {} elements, expected {}",
                spec.index,
                block.data.len(),
                spec.len()
            )));
        }
        for c in 0..spec.cols {
            let col = spec.offset + c;
            for r in 0..spec.rows {
                let row = spec.offset + r;
                let value = block.get(r, c);
                self.hits[row * self.n + col] += 1;
                self.matrix[row * self.n + col] = value;
                self.matrix[col * self.n + row] = value;
            }
        }
        Ok(())
    }

    /// Write counts per entry (row-major); entries above the block diagonal stay zero.
    pub fn hits(&self) -> &[u32] {
        &self.hits
    }

    /// Dense symmetric matrix (row-major).
    pub fn matrix(&self) -> &[T] {
        &self.matrix
    }

    pub fn into_matrix(self) -> Vec<T> {
        self.matrix
    }
}

/// CPU reference `X^T X` for a local `m x n` matrix stored with `n` fastest.
///
/// Returns the dense `n x n` result in row-major order.
pub fn reference_gram<T: GramScalar>(x: &[T], m: usize, n: usize) -> Result<Vec<T>> {
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
    let mut gram = vec![T::zero(); n * n];
    if n == 0 {
        return Ok(gram);
    }
    for row in x.chunks_exact(n).take(m) {
        for i in 0..n {
            let xi = row[i];
            for j in 0..n {
                gram[i * n + j] = gram[i * n + j] + xi * row[j];
            }
        }
    }
    Ok(gram)
}
