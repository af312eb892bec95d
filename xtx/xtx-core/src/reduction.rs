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


//! Reduction strategy selection.
//!
//! The pipeline either reduces each block on the device before the copy
//! (device-direct) or after it on the pinned staging buffer (host-staged); it
//! never mixes the two within one call. Device-aware message passing only
//! applies to the whole-buffer baseline.

use crate::comm::DeviceCollective;
use crate::config::PipelineConfig;
use crate::device::DeviceRuntime;
use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// Where a cross-rank sum is performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReductionPath {
    /// Collective library reducing device memory on a stream
    DeviceDirect,
    /// Message passing that accepts device pointers, synchronous
    DeviceAwareMessagePassing,
    /// Message passing over the pinned host staging buffer
    HostStaged,
}

impl ReductionPath {
    /// Parse `device`/`device-direct`, `device-aware`, `host`/`host-staged`. Unknown => None.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("device") || s.eq_ignore_ascii_case("device-direct") {
            Some(ReductionPath::DeviceDirect)
        } else if s.eq_ignore_ascii_case("device-aware") {
            Some(ReductionPath::DeviceAwareMessagePassing)
        } else if s.eq_ignore_ascii_case("host") || s.eq_ignore_ascii_case("host-staged") {
            Some(ReductionPath::HostStaged)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReductionPath::DeviceDirect => "device-direct",
            ReductionPath::DeviceAwareMessagePassing => "device-aware",
            ReductionPath::HostStaged => "host-staged",
        }
    }
}

impl std::fmt::Display for ReductionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of what the communication stack supports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub device_collective: bool,
    pub device_aware_message_passing: bool,
}

impl BackendCapabilities {
    /// Block pipeline path: device-direct whenever any device-capable transport exists.
    pub fn pipeline_path(&self) -> ReductionPath {
        if self.device_collective || self.device_aware_message_passing {
            ReductionPath::DeviceDirect
        } else {
            ReductionPath::HostStaged
        }
    }

    /// Paths exercised by the whole-buffer baseline, in run order.
    pub fn baseline_paths(&self) -> Vec<ReductionPath> {
        let mut paths = Vec::with_capacity(2);
        if self.device_collective {
            paths.push(ReductionPath::DeviceDirect);
        }
        if self.device_aware_message_passing {
            paths.push(ReductionPath::DeviceAwareMessagePassing);
        }
        paths
    }
}

/// Reduction resolved for one pipeline call.
pub enum ReductionBackend<'a, R: DeviceRuntime, T: GramScalar> {
    DeviceDirect(&'a dyn DeviceCollective<R, T>),
    HostStaged,
}

impl<'a, R: DeviceRuntime, T: GramScalar> ReductionBackend<'a, R, T> {
    /// Bind `path` to a backend. Device-direct requires a device collective.
    pub fn select(path: ReductionPath, collective: Option<&'a dyn DeviceCollective<R, T>>) -> Result<Self> {
        match path {
            ReductionPath::DeviceDirect => collective.map(ReductionBackend::DeviceDirect).ok_or_else(|| {
                GramError::Collective(
                    "Device-direct reduction selected but no device collective is available".to_string(),
                )
            }),
            ReductionPath::HostStaged => Ok(ReductionBackend::HostStaged),
            ReductionPath::DeviceAwareMessagePassing => Err(GramError::Precondition(
                "Device-aware message passing applies to the whole-buffer baseline, not the block pipeline"
                    .to_string(),
            )),
        }
    }

    /// Capability-derived path, overridden by `config.reduction` when set.
    pub fn resolve(
        capabilities: BackendCapabilities,
        collective: Option<&'a dyn DeviceCollective<R, T>>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let path = config.reduction.unwrap_or_else(|| capabilities.pipeline_path());
        log::debug!(
            "Reduction path {} (capabilities: {:?}, override: {:?})",
            path,
            capabilities,
            config.reduction
        );
        Self::select(path, collective)
    }

    pub fn path(&self) -> ReductionPath {
        match self {
            ReductionBackend::DeviceDirect(_) => ReductionPath::DeviceDirect,
            ReductionBackend::HostStaged => ReductionPath::HostStaged,
        }
    }
}

impl<R: DeviceRuntime, T: GramScalar> std::fmt::Debug for ReductionBackend<'_, R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReductionBackend({})", self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalCommunicator, SimDeviceCollective};
    use crate::device::sim::SimDevice;

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!(ReductionPath::parse("device"), Some(ReductionPath::DeviceDirect));
        assert_eq!(ReductionPath::parse(" Device-Direct "), Some(ReductionPath::DeviceDirect));
        assert_eq!(ReductionPath::parse("host"), Some(ReductionPath::HostStaged));
        assert_eq!(ReductionPath::parse("HOST-STAGED"), Some(ReductionPath::HostStaged));
        assert_eq!(
            ReductionPath::parse("device-aware"),
            Some(ReductionPath::DeviceAwareMessagePassing)
        );
        assert_eq!(ReductionPath::parse("gpu"), None);
    }

    #[test]
    fn capability_table() {
        let none = BackendCapabilities::default();
        assert_eq!(none.pipeline_path(), ReductionPath::HostStaged);
        assert!(none.baseline_paths().is_empty());

        let aware_only = BackendCapabilities {
            device_collective: false,
            device_aware_message_passing: true,
        };
        assert_eq!(aware_only.pipeline_path(), ReductionPath::DeviceDirect);
        assert_eq!(
            aware_only.baseline_paths(),
            vec![ReductionPath::DeviceAwareMessagePassing]
        );

        let both = BackendCapabilities {
            device_collective: true,
            device_aware_message_passing: true,
        };
        assert_eq!(
            both.baseline_paths(),
            vec![
                ReductionPath::DeviceDirect,
                ReductionPath::DeviceAwareMessagePassing
            ]
        );
    }

    #[test]
    fn device_direct_without_collective_is_rejected() {
        let backend = ReductionBackend::<SimDevice, f64>::select(ReductionPath::DeviceDirect, None);
        assert!(matches!(backend, Err(GramError::Collective(_))));
        let backend =
            ReductionBackend::<SimDevice, f64>::select(ReductionPath::DeviceAwareMessagePassing, None);
        assert!(matches!(backend, Err(GramError::Precondition(_))));
    }

    #[test]
    fn override_wins_over_capabilities() {
        let comm = LocalCommunicator::group(1).unwrap().pop().unwrap();
        let collective = SimDeviceCollective::init(&comm).unwrap();
        let caps = BackendCapabilities {
            device_collective: true,
            device_aware_message_passing: false,
        };

        let resolved =
            ReductionBackend::<SimDevice, f64>::resolve(caps, Some(&collective), &PipelineConfig::default())
                .unwrap();
        assert_eq!(resolved.path(), ReductionPath::DeviceDirect);

        let config = PipelineConfig {
            reduction: Some(ReductionPath::HostStaged),
            ..Default::default()
        };
        let resolved = ReductionBackend::<SimDevice, f64>::resolve(caps, Some(&collective), &config).unwrap();
        assert_eq!(resolved.path(), ReductionPath::HostStaged);
    }
}
