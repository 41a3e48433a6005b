//! Master/slave collectives inside one participant.
//!
//! Rank 0 of a participant is the master; every other rank holds a channel
//! to the master only. Collectives are implemented as explicit gather /
//! broadcast sequences over those channels, so results are identical on all
//! ranks up to the floating-point associativity of the master's reduction
//! order.

use tracing::trace;

use crate::com::{Communication, CommunicationFactory};
use crate::error::{CoupleError, Result};
use crate::ids::Rank;

/// Intra-participant communicator of one rank.
///
/// In serial mode (single-rank participant) no channel exists and every
/// collective degenerates to its local computation.
pub struct IntraComm {
  rank: Rank,
  size: usize,
  com: Option<Box<dyn Communication>>,
}

impl IntraComm {
  /// Communicator of a single-rank participant.
  pub fn serial() -> Self {
    Self { rank: 0, size: 1, com: None }
  }

  /// Master-side communicator; `com` must be connected to `size - 1` slaves.
  pub fn master(com: Box<dyn Communication>, size: usize) -> Self {
    assert!(size >= 2, "a master needs at least one slave");
    Self { rank: 0, size, com: Some(com) }
  }

  /// Slave-side communicator; `com` must be connected to the master.
  pub fn slave(com: Box<dyn Communication>, rank: Rank, size: usize) -> Self {
    assert!(rank >= 1 && rank < size, "slave rank out of range");
    Self { rank, size, com: Some(com) }
  }

  /// Connects the master side of a participant's intra channel.
  pub fn connect_master(
    participant: &str,
    size: usize,
    factory: &dyn CommunicationFactory,
  ) -> Result<Self> {
    let mut com = factory.new_communication();
    com.accept_connection(&format!("{participant}-master"), &format!("{participant}-slaves"))?;
    Ok(Self::master(com, size))
  }

  /// Connects one slave of a participant's intra channel.
  pub fn connect_slave(
    participant: &str,
    rank: Rank,
    size: usize,
    factory: &dyn CommunicationFactory,
  ) -> Result<Self> {
    let mut com = factory.new_communication();
    // Slave ranks 1..size map to requester ranks 0..size-1.
    com.request_connection(
      &format!("{participant}-master"),
      &format!("{participant}-slaves"),
      rank - 1,
      size - 1,
    )?;
    Ok(Self::slave(com, rank, size))
  }

  pub fn rank(&self) -> Rank {
    self.rank
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn is_parallel(&self) -> bool {
    self.size > 1
  }

  pub fn is_master(&self) -> bool {
    self.is_parallel() && self.rank == 0
  }

  pub fn is_slave(&self) -> bool {
    self.rank != 0
  }

  fn com(&self) -> Result<&dyn Communication> {
    self
      .com
      .as_deref()
      .ok_or_else(|| CoupleError::NotConnected("intra-participant channel".into()))
  }

  /// Endpoint index of a slave rank on the master's channel.
  #[inline]
  fn slave_index(rank: Rank) -> usize {
    rank - 1
  }

  // ---------------------------------------------------------------------
  // Broadcasts (master -> slaves)
  // ---------------------------------------------------------------------

  pub fn broadcast_f64s(&self, buf: &mut [f64]) -> Result<()> {
    if !self.is_parallel() {
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_f64s(buf, Self::slave_index(rank))?;
      }
    } else {
      let values = com.recv_f64s(buf.len(), 0)?;
      buf.copy_from_slice(&values);
    }
    Ok(())
  }

  pub fn broadcast_usizes(&self, buf: &mut [usize]) -> Result<()> {
    if !self.is_parallel() {
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_usizes(buf, Self::slave_index(rank))?;
      }
    } else {
      let values = com.recv_usizes(buf.len(), 0)?;
      buf.copy_from_slice(&values);
    }
    Ok(())
  }

  pub fn broadcast_bool(&self, value: &mut bool) -> Result<()> {
    if !self.is_parallel() {
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_bool(*value, Self::slave_index(rank))?;
      }
    } else {
      *value = com.recv_bool(0)?;
    }
    Ok(())
  }

  pub fn broadcast_f64(&self, value: &mut f64) -> Result<()> {
    if !self.is_parallel() {
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_f64(*value, Self::slave_index(rank))?;
      }
    } else {
      *value = com.recv_f64(0)?;
    }
    Ok(())
  }

  pub fn broadcast_usize(&self, value: &mut usize) -> Result<()> {
    if !self.is_parallel() {
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_usize(*value, Self::slave_index(rank))?;
      }
    } else {
      *value = com.recv_usize(0)?;
    }
    Ok(())
  }

  /// Broadcasts a variable-length index list; slaves learn the length first.
  pub fn broadcast_var_usizes(&self, data: &[usize]) -> Result<Vec<usize>> {
    if !self.is_parallel() {
      return Ok(data.to_vec());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        let index = Self::slave_index(rank);
        com.send_usize(data.len(), index)?;
        com.send_usizes(data, index)?;
      }
      Ok(data.to_vec())
    } else {
      let len = com.recv_usize(0)?;
      com.recv_usizes(len, 0)
    }
  }

  // ---------------------------------------------------------------------
  // Gathers and reductions (slaves -> master)
  // ---------------------------------------------------------------------

  /// Gathers per-rank value slices on the master. `counts[r]` names the
  /// expected length of rank r's slice and is only consulted on the master.
  /// Slaves return an empty list.
  pub fn gather_f64s(&self, local: &[f64], counts: &[usize]) -> Result<Vec<Vec<f64>>> {
    if !self.is_parallel() {
      return Ok(vec![local.to_vec()]);
    }
    let com = self.com()?;
    if self.is_master() {
      let mut slices = Vec::with_capacity(self.size);
      slices.push(local.to_vec());
      for rank in 1..self.size {
        slices.push(com.recv_f64s(counts[rank], Self::slave_index(rank))?);
      }
      Ok(slices)
    } else {
      com.send_f64s(local, 0)?;
      Ok(Vec::new())
    }
  }

  /// Gathers variable-length index lists on the master.
  pub fn gather_var_usizes(&self, local: &[usize]) -> Result<Vec<Vec<usize>>> {
    if !self.is_parallel() {
      return Ok(vec![local.to_vec()]);
    }
    let com = self.com()?;
    if self.is_master() {
      let mut lists = Vec::with_capacity(self.size);
      lists.push(local.to_vec());
      for rank in 1..self.size {
        let index = Self::slave_index(rank);
        let len = com.recv_usize(index)?;
        lists.push(com.recv_usizes(len, index)?);
      }
      Ok(lists)
    } else {
      com.send_usize(local.len(), 0)?;
      com.send_usizes(local, 0)?;
      Ok(Vec::new())
    }
  }

  /// Scatters variable-length index lists from the master; each rank
  /// receives only its own list.
  pub fn scatter_var_usizes(&self, lists: &[Vec<usize>]) -> Result<Vec<usize>> {
    if !self.is_parallel() {
      return Ok(lists[0].clone());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        let index = Self::slave_index(rank);
        com.send_usize(lists[rank].len(), index)?;
        com.send_usizes(&lists[rank], index)?;
      }
      Ok(lists[0].clone())
    } else {
      let len = com.recv_usize(0)?;
      com.recv_usizes(len, 0)
    }
  }

  /// Scatters per-rank slices from the master; returns this rank's slice.
  pub fn scatter_f64s(&self, slices: &[Vec<f64>], my_len: usize) -> Result<Vec<f64>> {
    if !self.is_parallel() {
      return Ok(slices[0].clone());
    }
    let com = self.com()?;
    if self.is_master() {
      for rank in 1..self.size {
        com.send_f64s(&slices[rank], Self::slave_index(rank))?;
      }
      Ok(slices[0].clone())
    } else {
      com.recv_f64s(my_len, 0)
    }
  }

  /// Sums element-wise into `out` on the master; slaves leave `out` as is.
  pub fn reduce_sum_f64s(&self, local: &[f64], out: &mut [f64]) -> Result<()> {
    if !self.is_parallel() {
      out.copy_from_slice(local);
      return Ok(());
    }
    let com = self.com()?;
    if self.is_master() {
      out.copy_from_slice(local);
      for rank in 1..self.size {
        let part = com.recv_f64s(local.len(), Self::slave_index(rank))?;
        for (o, p) in out.iter_mut().zip(part.iter()) {
          *o += p;
        }
      }
    } else {
      com.send_f64s(local, 0)?;
    }
    Ok(())
  }

  /// Element-wise sum over all ranks, result available everywhere.
  pub fn allreduce_sum_f64s(&self, local: &[f64], out: &mut [f64]) -> Result<()> {
    self.reduce_sum_f64s(local, out)?;
    self.broadcast_f64s(out)
  }

  pub fn allreduce_sum_f64(&self, local: f64) -> Result<f64> {
    let mut out = [0.0];
    self.allreduce_sum_f64s(&[local], &mut out)?;
    Ok(out[0])
  }

  pub fn allreduce_sum_usize(&self, local: usize) -> Result<usize> {
    let sum = self.allreduce_sum_f64(local as f64)?;
    Ok(sum as usize)
  }

  /// Per-rank values of `local`, in rank order, available everywhere.
  pub fn allgather_usize(&self, local: usize) -> Result<Vec<usize>> {
    if !self.is_parallel() {
      return Ok(vec![local]);
    }
    let com = self.com()?;
    let mut all = vec![0usize; self.size];
    if self.is_master() {
      all[0] = local;
      for rank in 1..self.size {
        all[rank] = com.recv_usize(Self::slave_index(rank))?;
      }
    } else {
      com.send_usize(local, 0)?;
    }
    self.broadcast_usizes(&mut all)?;
    Ok(all)
  }

  // ---------------------------------------------------------------------
  // Distributed inner products
  // ---------------------------------------------------------------------

  /// Distributed dot product: every rank contributes its local sum, rank 0
  /// adds them up and hands the total back.
  pub fn dot(&self, a: &[f64], b: &[f64]) -> Result<f64> {
    debug_assert_eq!(a.len(), b.len());
    let local: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    if !self.is_parallel() {
      return Ok(local);
    }
    let total = self.allreduce_sum_f64(local)?;
    trace!(local, total, "distributed dot");
    Ok(total)
  }

  /// Distributed Euclidean norm using the same protocol as [`Self::dot`].
  pub fn l2norm(&self, v: &[f64]) -> Result<f64> {
    Ok(self.dot(v, v)?.sqrt())
  }

  /// Distributed weighted root-mean-square norm:
  /// `sqrt(sum((w_i v_i)^2) / N)` with N the global length.
  pub fn wrms_norm(&self, v: &[f64], weights: &[f64]) -> Result<f64> {
    debug_assert_eq!(v.len(), weights.len());
    let local: f64 = v.iter().zip(weights.iter()).map(|(x, w)| (x * w) * (x * w)).sum();
    let (sum, count) = if self.is_parallel() {
      let mut out = [0.0, 0.0];
      self.allreduce_sum_f64s(&[local, v.len() as f64], &mut out)?;
      (out[0], out[1])
    } else {
      (local, v.len() as f64)
    };
    if count == 0.0 {
      return Ok(0.0);
    }
    Ok((sum / count).sqrt())
  }
}

#[cfg(test)]
#[path = "intra_test.rs"]
mod intra_test;
