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


//! In-process communicator: one member per thread, connected by channels.

use std::any::Any;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::HostCollective;
use crate::error::{GramError, Result};
use crate::types::GramScalar;

type Message = Box<dyn Any + Send>;

/// Group member backed by a full mesh of crossbeam channels.
///
/// Reductions sum contributions in rank order, so every member ends up with
/// bitwise-identical results. A member that goes away disconnects its
/// channels and peers get a [`GramError::Collective`] instead of hanging.
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    // indexed by destination rank
    outbound: Vec<Sender<Message>>,
    // indexed by source rank
    inbound: Vec<Receiver<Message>>,
    epoch: Instant,
}

impl LocalCommunicator {
    /// Create a connected group of `size` members, in rank order.
    pub fn group(size: usize) -> Result<Vec<LocalCommunicator>> {
        if size == 0 {
            return Err(GramError::Precondition(
                "Communicator group size must be at least 1".to_string(),
            ));
        }
        let epoch = Instant::now();
        // channels[src][dst]
        let mut senders: Vec<Vec<Sender<Message>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Option<Receiver<Message>>>> =
            (0..size).map(|_| (0..size).map(|_| None).collect()).collect();
        for src in 0..size {
            let mut row = Vec::with_capacity(size);
            for dst_receivers in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                row.push(tx);
                dst_receivers[src] = Some(rx);
            }
            senders.push(row);
        }
        let members = senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outbound, inbound))| LocalCommunicator {
                rank,
                size,
                outbound,
                inbound: inbound.into_iter().flatten().collect(),
                epoch,
            })
            .collect();
        Ok(members)
    }

    /// Collective: every member receives its member of a fresh group of the same size.
    ///
    /// Traffic on the duplicate never interleaves with traffic on the original.
    pub fn duplicate(&self) -> Result<LocalCommunicator> {
        if self.rank == 0 {
            let mut members = Self::group(self.size)?.into_iter();
            let own = members.next().ok_or_else(|| {
                GramError::Collective("Duplicated group is empty".to_string())
            })?;
            for (peer, member) in members.enumerate() {
                self.send(peer + 1, Box::new(member))?;
            }
            Ok(own)
        } else {
            let message = self.recv(0)?;
            message
                .downcast::<LocalCommunicator>()
                .map(|member| *member)
                .map_err(|_| {
                    GramError::Collective(format!(
                        "Rank {}: unexpected message while duplicating communicator",
                        self.rank
                    ))
                })
        }
    }

    fn send(&self, dst: usize, message: Message) -> Result<()> {
        self.outbound[dst].send(message).map_err(|_| {
            GramError::Collective(format!("Rank {}: peer {} has left the group", self.rank, dst))
        })
    }

    fn recv(&self, src: usize) -> Result<Message> {
        self.inbound[src].recv().map_err(|_| {
            GramError::Collective(format!("Rank {}: peer {} has left the group", self.rank, src))
        })
    }

    fn recv_vec<T: 'static>(&self, src: usize) -> Result<Vec<T>> {
        self.recv(src)?
            .downcast::<Vec<T>>()
            .map(|data| *data)
            .map_err(|_| {
                GramError::Collective(format!(
                    "Rank {}: mismatched collective from peer {}",
                    self.rank, src
                ))
            })
    }
}

impl HostCollective for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        for peer in (0..self.size).filter(|&p| p != self.rank) {
            self.send(peer, Box::new(()))?;
        }
        for peer in (0..self.size).filter(|&p| p != self.rank) {
            self.recv(peer)?.downcast::<()>().map_err(|_| {
                GramError::Collective(format!(
                    "Rank {}: mismatched barrier from peer {}",
                    self.rank, peer
                ))
            })?;
        }
        Ok(())
    }

    fn wtime(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn all_reduce_sum_in_place<T: GramScalar>(&self, data: &mut [T]) -> Result<()> {
        if self.size == 1 {
            return Ok(());
        }
        for peer in (0..self.size).filter(|&p| p != self.rank) {
            self.send(peer, Box::new(data.to_vec()))?;
        }
        let mut sum = vec![T::zero(); data.len()];
        for src in 0..self.size {
            if src == self.rank {
                sum.iter_mut().zip(data.iter()).for_each(|(acc, &v)| *acc = *acc + v);
                continue;
            }
            let contribution: Vec<T> = self.recv_vec(src)?;
            if contribution.len() != data.len() {
                return Err(GramError::Collective(format!(
                    "Rank {}: peer {} contributed {} elements, expected {}",
                    self.rank,
                    src,
                    contribution.len(),
                    data.len()
                )));
            }
            sum.iter_mut()
                .zip(contribution)
                .for_each(|(acc, v)| *acc = *acc + v);
        }
        data.copy_from_slice(&sum);
        Ok(())
    }

    fn broadcast_bytes(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        if root >= self.size {
            return Err(GramError::Precondition(format!(
                "Broadcast root {} outside group of {}",
                root, self.size
            )));
        }
        if self.rank == root {
            for peer in (0..self.size).filter(|&p| p != root) {
                self.send(peer, Box::new(data.clone()))?;
            }
        } else {
            *data = self.recv_vec(root)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(LocalCommunicator) -> R + Send + Sync + Copy + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = LocalCommunicator::group(size)
            .unwrap()
            .into_iter()
            .map(|comm| thread::spawn(move || f(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn group_rejects_zero_size() {
        assert!(matches!(
            LocalCommunicator::group(0),
            Err(GramError::Precondition(_))
        ));
    }

    #[test]
    fn all_reduce_sums_across_ranks() {
        let results = run_group(3, |comm| {
            let r = comm.rank() as f64;
            let mut data = vec![r, 10.0 * r, 1.0];
            comm.all_reduce_sum_in_place(&mut data).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![3.0, 30.0, 3.0]);
        }
    }

    #[test]
    fn single_rank_reduction_is_identity() {
        let comm = LocalCommunicator::group(1).unwrap().pop().unwrap();
        let mut data = vec![1.5f32, -2.0];
        comm.all_reduce_sum_in_place(&mut data).unwrap();
        comm.barrier().unwrap();
        assert_eq!(data, vec![1.5, -2.0]);
    }

    #[test]
    fn broadcast_copies_root_bytes() {
        let results = run_group(3, |comm| {
            let mut data = if comm.rank() == 1 { vec![7u8, 8, 9] } else { Vec::new() };
            comm.broadcast_bytes(1, &mut data).unwrap();
            data
        });
        for data in results {
            assert_eq!(data, vec![7, 8, 9]);
        }
    }

    #[test]
    fn duplicate_is_independent_of_original() {
        let results = run_group(2, |comm| {
            let dup = comm.duplicate().unwrap();
            assert_eq!(dup.rank(), comm.rank());
            assert_eq!(dup.size(), 2);
            let mut a = vec![1.0f64];
            let mut b = vec![100.0f64];
            // opposite issue order on the two groups must not cross-match
            if comm.rank() == 0 {
                comm.all_reduce_sum_in_place(&mut a).unwrap();
                dup.all_reduce_sum_in_place(&mut b).unwrap();
            } else {
                let t = thread::scope(|s| {
                    let h = s.spawn(|| {
                        let mut b2 = b.clone();
                        dup.all_reduce_sum_in_place(&mut b2).unwrap();
                        b2
                    });
                    comm.all_reduce_sum_in_place(&mut a).unwrap();
                    h.join().unwrap()
                });
                b = t;
            }
            (a[0], b[0])
        });
        for (a, b) in results {
            assert_eq!(a, 2.0);
            assert_eq!(b, 200.0);
        }
    }

    #[test]
    fn departed_peer_is_a_collective_error() {
        let mut members = LocalCommunicator::group(2).unwrap();
        let survivor = members.remove(0);
        drop(members);
        let mut data = vec![1.0f64];
        assert!(matches!(
            survivor.all_reduce_sum_in_place(&mut data),
            Err(GramError::Collective(_))
        ));
        assert!(survivor.barrier().is_err());
    }

    #[test]
    fn mismatched_types_are_reported() {
        let results = run_group(2, |comm| {
            if comm.rank() == 0 {
                let mut data = vec![1.0f64];
                comm.all_reduce_sum_in_place(&mut data).map(|_| ())
            } else {
                let mut data = vec![1.0f32];
                comm.all_reduce_sum_in_place(&mut data).map(|_| ())
            }
        });
        assert!(results.iter().all(|r| matches!(r, Err(GramError::Collective(_)))));
    }
}
