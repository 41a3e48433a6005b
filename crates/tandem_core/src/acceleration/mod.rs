//! Fixed-point acceleration of implicit coupling iterations.
//!
//! An acceleration transforms the raw values received in an iteration into
//! the next iterate, in place inside the coupling data buffers. Variants
//! range from plain under-relaxation to multi-vector quasi-Newton with a
//! distributed inverse-Jacobian update. They operate on the concatenation
//! of all configured data fields, in data-id order, so the stacked vectors
//! are identical on every rank boundary.

use std::collections::BTreeMap;

use crate::cplscheme::DataMap;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;

pub mod aitken;
pub mod constant;
pub mod iqn_ils;
pub mod iqn_imvj;
pub mod manifold;
pub mod parallel_matrix;

#[cfg(test)]
pub mod test_utils;

pub use aitken::AitkenAcceleration;
pub use constant::ConstantRelaxation;
pub use iqn_ils::IqnIlsAcceleration;
pub use iqn_imvj::IqnImvjAcceleration;
pub use manifold::ManifoldMapping;
pub use parallel_matrix::ParallelMatrixOperations;

/// One fixed-point acceleration variant.
pub trait Acceleration {
  /// Data ids this variant operates on; it must never touch other data.
  fn data_ids(&self) -> &[DataId];

  /// Inspects dimensions and allocates internal buffers.
  fn initialize(&mut self, data: &DataMap) -> Result<()>;

  /// Computes the next iterate in place from the current raw values and
  /// the previous iterate (`old_values` column 0).
  fn perform(&mut self, data: &DataMap) -> Result<()>;

  /// Called when the outer scheme declares convergence; resets the
  /// iteration counter and per-timestep buffers.
  fn iterations_converged(&mut self, data: &DataMap) -> Result<()>;

  /// Sets the target residual, sized as the concatenation of all
  /// configured data vectors.
  fn set_design_specification(&mut self, q: &[f64]) -> Result<()>;

  /// Target residual split per data id, consumed by convergence measures.
  fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, Vec<f64>>;
}

/// Total scalar length of the configured data vectors.
pub(crate) fn concatenated_len(ids: &[DataId], data: &DataMap) -> Result<usize> {
  let mut len = 0;
  for id in ids {
    let cell = data
      .get(id)
      .ok_or_else(|| CoupleError::Config(format!("acceleration data {id:?} is not coupled")))?;
    len += cell.borrow().len();
  }
  Ok(len)
}

/// Stacks the current values of the configured data, in id order.
pub(crate) fn concat_values(ids: &[DataId], data: &DataMap) -> Vec<f64> {
  let mut out = Vec::new();
  for id in ids {
    out.extend(data[id].borrow().values());
  }
  out
}

/// Stacks the previous iterate (`old_values` column 0), in id order.
pub(crate) fn concat_old(ids: &[DataId], data: &DataMap) -> Vec<f64> {
  let mut out = Vec::new();
  for id in ids {
    out.extend(data[id].borrow().old_column());
  }
  out
}

/// Scatters a stacked vector back into the data buffers, in id order.
pub(crate) fn write_back(ids: &[DataId], data: &DataMap, stacked: &[f64]) {
  let mut offset = 0;
  for id in ids {
    let cell = data[id].borrow();
    let len = cell.len();
    cell.set_values(&stacked[offset..offset + len]);
    offset += len;
  }
}

/// Splits a stacked vector per data id, in id order.
pub(crate) fn split_per_data(ids: &[DataId], data: &DataMap, stacked: &[f64]) -> BTreeMap<DataId, Vec<f64>> {
  let mut out = BTreeMap::new();
  let mut offset = 0;
  for id in ids {
    let len = data[id].borrow().len();
    out.insert(*id, stacked[offset..offset + len].to_vec());
    offset += len;
  }
  out
}

/// Appends a lazily allocated zero "old values" column to every cell that
/// has none yet; schemes normally do this, accelerations guarantee it.
pub(crate) fn ensure_old_columns(data: &DataMap) {
  for cell in data.values() {
    cell.borrow_mut().ensure_old_columns(1);
  }
}
