//! Aitken under-relaxation with a dynamic factor.
//!
//! The factor restarts every timestep at
//! `omega_0 = sign(omega_prev) * min(initial, |omega_prev|)` and is updated
//! from the two latest residuals via
//! `omega_k = -omega_{k-1} * <r_{k-1}, dr> / <dr, dr>` with
//! `dr = r_k - r_{k-1}`. Inner products are distributed.

use std::collections::BTreeMap;
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::debug;

use crate::acceleration::{
  concat_old, concat_values, concatenated_len, ensure_old_columns, split_per_data, write_back,
  Acceleration,
};
use crate::com::IntraComm;
use crate::cplscheme::DataMap;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;

pub struct AitkenAcceleration {
  initial_relaxation: f64,
  data_ids: SmallVec<[DataId; 2]>,
  aitken_factor: f64,
  iteration_counter: usize,
  residuals: Vec<f64>,
  design_specification: Vec<f64>,
  intra: Rc<IntraComm>,
}

impl AitkenAcceleration {
  pub fn new(
    initial_relaxation: f64,
    data_ids: impl IntoIterator<Item = DataId>,
    intra: Rc<IntraComm>,
  ) -> Result<Self> {
    if initial_relaxation <= 0.0 || initial_relaxation > 1.0 {
      return Err(CoupleError::Config(format!(
        "initial relaxation factor for aitken acceleration has to be larger than zero \
         and smaller or equal than one, got {initial_relaxation}"
      )));
    }
    let data_ids: SmallVec<[DataId; 2]> = data_ids.into_iter().collect();
    if data_ids.is_empty() || data_ids.len() > 2 {
      return Err(CoupleError::Config(
        "aitken acceleration operates on one or two data fields".into(),
      ));
    }
    Ok(Self {
      initial_relaxation,
      data_ids,
      aitken_factor: initial_relaxation,
      iteration_counter: 0,
      residuals: Vec::new(),
      design_specification: Vec::new(),
      intra,
    })
  }
}

impl Acceleration for AitkenAcceleration {
  fn data_ids(&self) -> &[DataId] {
    &self.data_ids
  }

  fn initialize(&mut self, data: &DataMap) -> Result<()> {
    let entries = concatenated_len(&self.data_ids, data)?;
    // Sentinel residuals mark "no previous iteration in this timestep".
    self.residuals = vec![f64::MAX; entries];
    self.design_specification = vec![0.0; entries];
    ensure_old_columns(data);
    Ok(())
  }

  fn perform(&mut self, data: &DataMap) -> Result<()> {
    let values = concat_values(&self.data_ids, data);
    let old_values = concat_old(&self.data_ids, data);
    let residuals: Vec<f64> =
      values.iter().zip(old_values.iter()).map(|(v, o)| v - o).collect();

    if self.iteration_counter == 0 {
      // Restart rule: keep the sign of the last factor, cap its magnitude.
      self.aitken_factor =
        self.aitken_factor.signum() * self.initial_relaxation.min(self.aitken_factor.abs());
    } else {
      let deltas: Vec<f64> =
        residuals.iter().zip(self.residuals.iter()).map(|(r, p)| r - p).collect();
      let nominator = self.intra.dot(&self.residuals, &deltas)?;
      let denominator = self.intra.dot(&deltas, &deltas)?;
      if denominator > f64::MIN_POSITIVE {
        self.aitken_factor = -self.aitken_factor * (nominator / denominator);
      }
    }
    debug!(factor = self.aitken_factor, "aitken factor");

    let omega = self.aitken_factor;
    let one_minus_omega = 1.0 - omega;
    let relaxed: Vec<f64> = values
      .iter()
      .zip(old_values.iter())
      .map(|(v, o)| omega * v + one_minus_omega * o)
      .collect();
    write_back(&self.data_ids, data, &relaxed);

    self.residuals = residuals;
    self.iteration_counter += 1;
    Ok(())
  }

  fn iterations_converged(&mut self, _data: &DataMap) -> Result<()> {
    self.iteration_counter = 0;
    self.residuals.iter_mut().for_each(|r| *r = f64::MAX);
    Ok(())
  }

  fn set_design_specification(&mut self, _q: &[f64]) -> Result<()> {
    Err(CoupleError::Config(
      "a design specification is not supported for aitken relaxation".into(),
    ))
  }

  fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, Vec<f64>> {
    split_per_data(&self.data_ids, data, &self.design_specification)
  }
}

#[cfg(test)]
#[path = "aitken_test.rs"]
mod aitken_test;
