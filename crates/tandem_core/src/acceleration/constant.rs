//! Constant under-relaxation.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::debug;

use crate::acceleration::{
  concat_old, concat_values, concatenated_len, ensure_old_columns, split_per_data, write_back,
  Acceleration,
};
use crate::cplscheme::DataMap;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;

/// Blends the new iterate with the previous one at a fixed factor:
/// `x <- omega * x_new + (1 - omega) * x_old`.
pub struct ConstantRelaxation {
  relaxation: f64,
  data_ids: SmallVec<[DataId; 2]>,
  design_specification: Vec<f64>,
}

impl ConstantRelaxation {
  pub fn new(relaxation: f64, data_ids: impl IntoIterator<Item = DataId>) -> Result<Self> {
    if relaxation <= 0.0 || relaxation > 1.0 {
      return Err(CoupleError::Config(format!(
        "constant relaxation factor has to be in (0; 1], got {relaxation}"
      )));
    }
    Ok(Self {
      relaxation,
      data_ids: data_ids.into_iter().collect(),
      design_specification: Vec::new(),
    })
  }
}

impl Acceleration for ConstantRelaxation {
  fn data_ids(&self) -> &[DataId] {
    &self.data_ids
  }

  fn initialize(&mut self, data: &DataMap) -> Result<()> {
    let entries = concatenated_len(&self.data_ids, data)?;
    self.design_specification = vec![0.0; entries];
    ensure_old_columns(data);
    Ok(())
  }

  fn perform(&mut self, data: &DataMap) -> Result<()> {
    let values = concat_values(&self.data_ids, data);
    let old = concat_old(&self.data_ids, data);
    let omega = self.relaxation;
    let relaxed: Vec<f64> =
      values.iter().zip(old.iter()).map(|(v, o)| omega * v + (1.0 - omega) * o).collect();
    debug!(omega, entries = relaxed.len(), "applied constant relaxation");
    write_back(&self.data_ids, data, &relaxed);
    Ok(())
  }

  fn iterations_converged(&mut self, _data: &DataMap) -> Result<()> {
    Ok(())
  }

  fn set_design_specification(&mut self, q: &[f64]) -> Result<()> {
    self.design_specification = q.to_vec();
    Ok(())
  }

  fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, Vec<f64>> {
    split_per_data(&self.data_ids, data, &self.design_specification)
  }
}

#[cfg(test)]
#[path = "constant_test.rs"]
mod constant_test;
