//! Distributed matrix products for the quasi-Newton variants.
//!
//! The interesting case is the square product `left * right` where `left`
//! is row-distributed `(n_local x m)` and `right` is column-distributed
//! `(m x n_local)`: every rank needs every other rank's `left` block. The
//! blocks travel around a ring of rank pairs; each rank posts one
//! asynchronous send to its successor and one asynchronous receive from
//! its predecessor per cycle, then waits. A fully synchronous ring would
//! deadlock on blocking transports.

use nalgebra::DMatrix;
use tracing::trace;

use crate::com::{Communication, CommunicationFactory, IntraComm};
use crate::error::Result;
use crate::ids::Rank;

/// Cyclic communicator pair plus the block-product kernels.
pub struct ParallelMatrixOperations {
  /// Channel receiving blocks from the predecessor rank.
  cyclic_left: Option<Box<dyn Communication>>,
  /// Channel sending blocks to the successor rank.
  cyclic_right: Option<Box<dyn Communication>>,
}

impl ParallelMatrixOperations {
  /// Serial instance without ring channels.
  pub fn serial() -> Self {
    Self { cyclic_left: None, cyclic_right: None }
  }

  /// Builds the ring `rank -> rank + 1 (mod size)`. Every rank accepts the
  /// incoming link and requests the outgoing one; rank 0 requests first to
  /// break the cycle of blocking setups.
  pub fn connect_ring(
    intra: &IntraComm,
    factory: &dyn CommunicationFactory,
    tag: &str,
  ) -> Result<Self> {
    if !intra.is_parallel() {
      return Ok(Self::serial());
    }
    let rank = intra.rank();
    let size = intra.size();
    let prev = (rank + size - 1) % size;
    let next = (rank + 1) % size;

    let mut left = factory.new_communication();
    let mut right = factory.new_communication();
    let incoming = format!("{tag}-ring-into-{rank}");
    let outgoing = format!("{tag}-ring-into-{next}");
    if rank == 0 {
      right.request_connection(&outgoing, &format!("{tag}-ring-from-{rank}"), 0, 1)?;
      left.accept_connection(&incoming, &format!("{tag}-ring-from-{prev}"))?;
    } else {
      left.accept_connection(&incoming, &format!("{tag}-ring-from-{prev}"))?;
      right.request_connection(&outgoing, &format!("{tag}-ring-from-{rank}"), 0, 1)?;
    }
    trace!(rank, prev, next, tag, "cyclic communicators connected");
    Ok(Self { cyclic_left: Some(left), cyclic_right: Some(right) })
  }

  pub fn has_ring(&self) -> bool {
    self.cyclic_left.is_some()
  }

  /// Rows held by `rank` according to exclusive-prefix `offsets`
  /// (`offsets.len() == size + 1`).
  fn rows_of(offsets: &[usize], rank: Rank) -> usize {
    offsets[rank + 1] - offsets[rank]
  }

  /// Square block product of a row-distributed `left (n_local x m)` with a
  /// column-distributed `right (m x n_local)`; the result is the caller's
  /// column block `(n_global x n_local)` of the global `(n x n)` product.
  pub fn multiply_nn(
    &self,
    left: &DMatrix<f64>,
    right: &DMatrix<f64>,
    offsets: &[usize],
    intra: &IntraComm,
  ) -> Result<DMatrix<f64>> {
    debug_assert_eq!(left.ncols(), right.nrows());
    if !intra.is_parallel() {
      return Ok(left * right);
    }
    let rank = intra.rank();
    let size = intra.size();
    let m = left.ncols();
    let n_global = offsets[size];
    let n_local = right.ncols();
    let mut result = DMatrix::zeros(n_global, n_local);

    let left_dyn: &dyn Communication =
      self.cyclic_left.as_deref().expect("ring connected");
    let right_dyn: &dyn Communication =
      self.cyclic_right.as_deref().expect("ring connected");

    // Post the first ring transfer before computing the diagonal block.
    let prev = (rank + size - 1) % size;
    let mut rows_incoming = Self::rows_of(offsets, prev);
    let mut pending_send = if !left.is_empty() {
      Some(right_dyn.asend_f64s(left.as_slice(), 0)?)
    } else {
      None
    };
    let mut pending_recv = if rows_incoming * m > 0 {
      Some(left_dyn.arecv_f64s(rows_incoming * m, 0))
    } else {
      None
    };

    // Diagonal block: all data local.
    let diag = left * right;
    result.view_mut((offsets[rank], 0), (diag.nrows(), diag.ncols())).copy_from(&diag);

    for cycle in 1..size {
      if let Some(request) = pending_send.take() {
        request.wait()?;
      }
      let block_data = match pending_recv.take() {
        Some(request) => request.wait()?,
        None => Vec::new(),
      };
      let incoming = DMatrix::from_column_slice(rows_incoming, m, &block_data);

      // Source rank whose block just arrived, and the one after it.
      let source = (rank + size - cycle) % size;
      let next_source = (rank + 2 * size - cycle - 1) % size;

      if cycle < size - 1 {
        if !incoming.is_empty() {
          pending_send = Some(right_dyn.asend_f64s(incoming.as_slice(), 0)?);
        }
        let rows_next = Self::rows_of(offsets, next_source);
        if rows_next * m > 0 {
          pending_recv = Some(left_dyn.arecv_f64s(rows_next * m, 0));
        }
        rows_incoming = rows_next;
      }

      let block = &incoming * right;
      result.view_mut((offsets[source], 0), (block.nrows(), block.ncols())).copy_from(&block);
    }

    Ok(result)
  }

  /// Product of a column-distributed matrix `(n_global x n_local)` with the
  /// local row slice of a distributed vector; the summed global result is
  /// reduced onto all ranks and the caller's row slice returned.
  pub fn apply_column_block(
    block: &DMatrix<f64>,
    local: &[f64],
    offsets: &[usize],
    intra: &IntraComm,
  ) -> Result<Vec<f64>> {
    let n_global = offsets[offsets.len() - 1];
    let partial = block * nalgebra::DVector::from_column_slice(local);
    debug_assert_eq!(partial.len(), n_global);
    let mut total = vec![0.0; n_global];
    intra.allreduce_sum_f64s(partial.as_slice(), &mut total)?;
    let rank = intra.rank();
    Ok(total[offsets[rank]..offsets[rank + 1]].to_vec())
  }

  /// Same reduction for a matrix right-hand side: `block (n_global x
  /// n_local) * local (n_local x m)`, summed over ranks, full result on
  /// every rank.
  pub fn accumulate_column_block(
    block: &DMatrix<f64>,
    local: &DMatrix<f64>,
    intra: &IntraComm,
  ) -> Result<DMatrix<f64>> {
    let partial = block * local;
    let mut total = vec![0.0; partial.len()];
    intra.allreduce_sum_f64s(partial.as_slice(), &mut total)?;
    Ok(DMatrix::from_column_slice(partial.nrows(), partial.ncols(), &total))
  }
}

#[cfg(test)]
#[path = "parallel_matrix_test.rs"]
mod parallel_matrix_test;
