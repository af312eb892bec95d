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


//! Pipeline config: block size and reduction path with env override and defaults.
//!
//! **Env:** `XTX_BLOCK_SIZE` (vectors per block, must divide N), `XTX_REDUCTION`
//! (`device`/`device-direct` or `host`/`host-staged`). Parse failure leaves the
//! field unset so the capability-derived default applies.

use crate::block::BlockPlan;
use crate::error::{GramError, Result};
use crate::reduction::ReductionPath;

/// Largest block size picked by [`PipelineConfig::with_defaults`].
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 732;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub block_size: Option<usize>,
    pub reduction: Option<ReductionPath>,
}

impl PipelineConfig {
    /// From env: XTX_BLOCK_SIZE, XTX_REDUCTION. Parse failure => leave None.
    pub fn from_env() -> Self {
        let block_size = std::env::var("XTX_BLOCK_SIZE")
            .ok()
            .and_then(|s| s.trim().parse().ok());
        let reduction = std::env::var("XTX_REDUCTION")
            .ok()
            .and_then(|s| ReductionPath::parse(&s));
        Self {
            block_size,
            reduction,
        }
    }

    /// Fill an unset block size with the largest divisor of `n` not above 732.
    pub fn with_defaults(mut self, n: usize) -> Self {
        if self.block_size.is_none() && n > 0 {
            self.block_size = Some(default_block_size(n));
        }
        self
    }

    /// Validate against `n` vectors: block size set, non-zero and dividing `n`.
    pub fn validate(&self, n: usize) -> Result<()> {
        let block_size = self.resolved_block_size()?;
        BlockPlan::new(n, block_size).map(|_| ())
    }

    /// Resolved block size. Requires block_size set.
    pub fn resolved_block_size(&self) -> Result<usize> {
        self.block_size.ok_or_else(|| {
            GramError::Precondition("block_size not set; call with_defaults first".to_string())
        })
    }
}

fn default_block_size(n: usize) -> usize {
    (1..=DEFAULT_MAX_BLOCK_SIZE.min(n))
        .rev()
        .find(|bs| n % bs == 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize env-dependent tests so parallel runs don't cross-talk.
    static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn from_env_unset() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::remove_var("XTX_BLOCK_SIZE");
            std::env::remove_var("XTX_REDUCTION");
        }
        let c = PipelineConfig::from_env();
        assert!(c.block_size.is_none());
        assert!(c.reduction.is_none());
    }

    #[test]
    fn from_env_parses() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("XTX_BLOCK_SIZE", "128");
            std::env::set_var("XTX_REDUCTION", "host-staged");
        }
        let c = PipelineConfig::from_env();
        assert_eq!(c.block_size, Some(128));
        assert_eq!(c.reduction, Some(ReductionPath::HostStaged));
        unsafe {
            std::env::set_var("XTX_BLOCK_SIZE", "lots");
            std::env::set_var("XTX_REDUCTION", "carrier-pigeon");
        }
        let c = PipelineConfig::from_env();
        assert!(c.block_size.is_none());
        assert!(c.reduction.is_none());
        unsafe {
            std::env::remove_var("XTX_BLOCK_SIZE");
            std::env::remove_var("XTX_REDUCTION");
        }
    }

    #[test]
    fn defaults_pick_largest_divisor() {
        assert_eq!(PipelineConfig::default().with_defaults(36600).block_size, Some(732));
        assert_eq!(PipelineConfig::default().with_defaults(1000).block_size, Some(500));
        assert_eq!(PipelineConfig::default().with_defaults(12).block_size, Some(12));
        // primes above the cap fall back to 1
        assert_eq!(PipelineConfig::default().with_defaults(739).block_size, Some(1));
        let explicit = PipelineConfig {
            block_size: Some(4),
            ..Default::default()
        };
        assert_eq!(explicit.with_defaults(12).block_size, Some(4));
    }

    #[test]
    fn validate_bounds() {
        let c = PipelineConfig {
            block_size: Some(4),
            ..Default::default()
        };
        assert!(c.validate(8).is_ok());
        assert!(matches!(c.validate(6), Err(GramError::Precondition(_))));
        let zero = PipelineConfig {
            block_size: Some(0),
            ..Default::default()
        };
        assert!(zero.validate(8).is_err());
        assert!(PipelineConfig::default().validate(8).is_err());
    }
}
