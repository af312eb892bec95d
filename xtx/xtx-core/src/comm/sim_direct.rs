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


//! Collectives for the simulated device.

use std::sync::Arc;

use super::{DeviceAwareCollective, DeviceCollective, HostCollective, LocalCommunicator};
use crate::device::sim::{SimBuffer, SimDevice, SimStream, TraceEvent};
use crate::error::{GramError, Result};
use crate::types::GramScalar;

/// Device-direct collective for [`SimDevice`].
///
/// Reductions run on the issuing stream's worker over a private duplicate of
/// the host communicator, so they never interleave with host-side traffic.
pub struct SimDeviceCollective {
    comm: Arc<LocalCommunicator>,
}

impl SimDeviceCollective {
    /// Collective over `comm`: every rank must call it.
    pub fn init(comm: &LocalCommunicator) -> Result<Self> {
        let dup = comm.duplicate()?;
        log::debug!(
            "Initialized simulated device collective: rank {} of {}",
            dup.rank(),
            dup.size()
        );
        Ok(Self { comm: Arc::new(dup) })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn size(&self) -> usize {
        self.comm.size()
    }
}

impl<T: GramScalar> DeviceCollective<SimDevice, T> for SimDeviceCollective {
    fn all_reduce_sum_in_place(
        &self,
        runtime: &SimDevice,
        buffer: &SimBuffer<T>,
        count: usize,
        stream: &SimStream,
    ) -> Result<()> {
        check_count(count, buffer)?;
        let data = buffer.data.clone();
        let comm = self.comm.clone();
        runtime.launch(
            stream,
            TraceEvent::Collective {
                stream: stream.id(),
                buffer: buffer.id(),
                len: count,
            },
            move || {
                let mut data = data.lock().unwrap_or_else(|p| p.into_inner());
                comm.all_reduce_sum_in_place(&mut data[..count])
            },
        )
    }
}

/// Device-aware message passing: the simulated device shares the host address space.
impl<T: GramScalar> DeviceAwareCollective<SimDevice, T> for LocalCommunicator {
    fn all_reduce_sum_device(
        &self,
        _runtime: &SimDevice,
        buffer: &mut SimBuffer<T>,
        count: usize,
    ) -> Result<()> {
        check_count(count, buffer)?;
        let mut data = buffer.data.lock().unwrap_or_else(|p| p.into_inner());
        self.all_reduce_sum_in_place(&mut data[..count])
    }
}

fn check_count<T>(count: usize, buffer: &SimBuffer<T>) -> Result<()> {
    use crate::device::DeviceBuffer;
    if count > buffer.len() {
        return Err(GramError::Collective(format!(
            "Reduction of {} elements exceeds buffer of {}",
            count,
            buffer.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceRuntime;
    use std::thread;

    #[test]
    fn device_collective_reduces_on_stream() {
        let handles: Vec<_> = LocalCommunicator::group(2)
            .unwrap()
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let device = SimDevice::new();
                    let collective = SimDeviceCollective::init(&comm).unwrap();
                    let stream = device.create_stream().unwrap();
                    let event = device.create_event().unwrap();
                    let value = (comm.rank() + 1) as f64;
                    let buffer = device.alloc(4, value).unwrap();
                    DeviceCollective::<SimDevice, f64>::all_reduce_sum_in_place(
                        &collective,
                        &device,
                        &buffer,
                        3,
                        &stream,
                    )
                    .unwrap();
                    device.record_event(&event, &stream).unwrap();
                    device.synchronize_event(&event).unwrap();
                    device.copy_to_vec(&buffer).unwrap()
                })
            })
            .collect();
        for h in handles {
            let value = h.join().unwrap();
            assert_eq!(value[..3], [3.0, 3.0, 3.0]);
            // elements past `count` are untouched
            assert!(value[3] == 1.0 || value[3] == 2.0);
        }
    }

    #[test]
    fn device_aware_reduction_blocks_until_done() {
        let handles: Vec<_> = LocalCommunicator::group(3)
            .unwrap()
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let device = SimDevice::new();
                    let mut buffer = device.alloc(2, 0.5f32).unwrap();
                    comm.all_reduce_sum_device(&device, &mut buffer, 2).unwrap();
                    device.copy_to_vec(&buffer).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![1.5f32, 1.5]);
        }
    }

    #[test]
    fn oversized_count_is_rejected() {
        let comm = LocalCommunicator::group(1).unwrap().pop().unwrap();
        let device = SimDevice::new();
        let mut buffer = device.alloc(2, 1.0f64).unwrap();
        assert!(matches!(
            comm.all_reduce_sum_device(&device, &mut buffer, 3),
            Err(GramError::Collective(_))
        ));
    }
}
