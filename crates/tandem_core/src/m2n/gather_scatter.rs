//! Gather-scatter distributed exchange.
//!
//! All inter-participant traffic runs over the master channel as full
//! global arrays. On the parallel side the master gathers slave slices
//! before sending and scatters slices after receiving; contributions of a
//! global vertex held by several ranks are *summed* on gather, assigned on
//! scatter. A single-rank participant sends and receives the global array
//! directly.

use std::rc::Rc;

use tracing::trace;

use crate::com::{IntraComm, PtrCommunication};
use crate::error::{CoupleError, Result};
use crate::m2n::DistributedCommunication;
use crate::mesh::PtrMesh;

pub struct GatherScatterCommunication {
  mesh: PtrMesh,
  intra: Rc<IntraComm>,
  master_com: PtrCommunication,
  connected: bool,
}

impl GatherScatterCommunication {
  pub fn new(mesh: PtrMesh, intra: Rc<IntraComm>, master_com: PtrCommunication) -> Self {
    Self { mesh, intra, master_com, connected: false }
  }

  /// Sizes of the per-rank slices recorded in the vertex distribution.
  fn rank_counts(&self, value_dim: usize) -> Vec<usize> {
    let mesh = self.mesh.borrow();
    (0..self.intra.size())
      .map(|rank| mesh.vertex_distribution().get(&rank).map_or(0, Vec::len) * value_dim)
      .collect()
  }

  fn global_len(&self, value_dim: usize) -> Result<usize> {
    match self.mesh.borrow().global_vertex_count() {
      Some(count) => Ok(count * value_dim),
      None => Err(CoupleError::NotReady(format!(
        "global vertex count of mesh {} unknown",
        self.mesh.borrow().name()
      ))),
    }
  }

  fn ensure_connected(&self) -> Result<()> {
    if !self.connected {
      return Err(CoupleError::NotReady("gather-scatter channel not connected".into()));
    }
    Ok(())
  }
}

impl DistributedCommunication for GatherScatterCommunication {
  fn is_connected(&self) -> bool {
    self.connected
  }

  fn accept_connection(&mut self, _acceptor: &str, _requester: &str) -> Result<()> {
    // Traffic reuses the master channel, so only its liveness matters here.
    if !self.intra.is_slave() && !self.master_com.borrow().is_connected() {
      return Err(CoupleError::NotConnected("master channel for gather-scatter".into()));
    }
    self.connected = true;
    Ok(())
  }

  fn request_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
    self.accept_connection(acceptor, requester)
  }

  fn close_connection(&mut self) -> Result<()> {
    self.connected = false;
    Ok(())
  }

  fn send(&mut self, values: &[f64], value_dim: usize) -> Result<()> {
    self.ensure_connected()?;
    if !self.intra.is_parallel() {
      // Single-rank side: the local array is the global array.
      let expected = self.global_len(value_dim)?;
      if values.len() != expected {
        return Err(CoupleError::SizeMismatch { expected, got: values.len() });
      }
      return self.master_com.borrow().send_f64s(values, 0);
    }

    let counts = self.rank_counts(value_dim);
    let slices = self.intra.gather_f64s(values, &counts)?;
    if self.intra.is_master() {
      let expected = counts[0];
      if values.len() != expected {
        return Err(CoupleError::SizeMismatch { expected, got: values.len() });
      }
      let mut global = vec![0.0; self.global_len(value_dim)?];
      let mesh = self.mesh.borrow();
      for (rank, slice) in slices.iter().enumerate() {
        let Some(globals) = mesh.vertex_distribution().get(&rank) else { continue };
        for (i, &g) in globals.iter().enumerate() {
          for d in 0..value_dim {
            // Duplicated vertices contribute once per holding rank.
            global[g * value_dim + d] += slice[i * value_dim + d];
          }
        }
      }
      trace!(len = global.len(), "gathered global field, sending");
      self.master_com.borrow().send_f64s(&global, 0)?;
    }
    Ok(())
  }

  fn receive(&mut self, values: &mut [f64], value_dim: usize) -> Result<()> {
    self.ensure_connected()?;
    if !self.intra.is_parallel() {
      let expected = self.global_len(value_dim)?;
      if values.len() != expected {
        return Err(CoupleError::SizeMismatch { expected, got: values.len() });
      }
      let global = self.master_com.borrow().recv_f64s(expected, 0)?;
      values.copy_from_slice(&global);
      return Ok(());
    }

    let my_len = values.len();
    let slice = if self.intra.is_master() {
      let global = self.master_com.borrow().recv_f64s(self.global_len(value_dim)?, 0)?;
      let mesh = self.mesh.borrow();
      let slices: Vec<Vec<f64>> = (0..self.intra.size())
        .map(|rank| {
          let globals = mesh.vertex_distribution().get(&rank).map_or(&[][..], Vec::as_slice);
          let mut slice = vec![0.0; globals.len() * value_dim];
          for (i, &g) in globals.iter().enumerate() {
            for d in 0..value_dim {
              slice[i * value_dim + d] = global[g * value_dim + d];
            }
          }
          slice
        })
        .collect();
      self.intra.scatter_f64s(&slices, my_len)?
    } else {
      self.intra.scatter_f64s(&[], my_len)?
    };
    if slice.len() != my_len {
      return Err(CoupleError::SizeMismatch { expected: my_len, got: slice.len() });
    }
    values.copy_from_slice(&slice);
    Ok(())
  }
}
