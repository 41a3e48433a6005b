//! Interface quasi-Newton with least-squares secant approximation.
//!
//! Builds column histories `V` of residual differences and `W` of value
//! differences across iterations (and, if configured, across reused
//! timesteps), solves the least-squares problem
//! `min || V c + (r - q) ||` through the distributed normal equations, and
//! updates `x <- x_tilde + W c`. On a singular system the step degrades to
//! plain under-relaxation with a warning.

use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::acceleration::{
  concat_old, concat_values, concatenated_len, ensure_old_columns, split_per_data, write_back,
  Acceleration,
};
use crate::com::IntraComm;
use crate::cplscheme::DataMap;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;

/// Secant history columns tagged with the timestep they were taken in.
pub(crate) struct DifferenceHistory {
  columns: Vec<(DVector<f64>, usize)>,
  max_columns: usize,
}

impl DifferenceHistory {
  pub fn new(max_columns: usize) -> Self {
    Self { columns: Vec::new(), max_columns }
  }

  /// Prepends the newest column; the oldest falls off the back.
  pub fn push(&mut self, column: DVector<f64>, timestep: usize) {
    self.columns.insert(0, (column, timestep));
    if self.columns.len() > self.max_columns {
      self.columns.truncate(self.max_columns);
    }
  }

  pub fn len(&self) -> usize {
    self.columns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.columns.is_empty()
  }

  pub fn column(&self, index: usize) -> &DVector<f64> {
    &self.columns[index].0
  }

  /// Local matrix with the stored columns, newest first.
  pub fn as_matrix(&self, rows: usize) -> DMatrix<f64> {
    let mut matrix = DMatrix::zeros(rows, self.columns.len());
    for (index, (column, _)) in self.columns.iter().enumerate() {
      matrix.set_column(index, column);
    }
    matrix
  }

  /// Drops columns older than the reuse window ending before `timestep`.
  pub fn retire(&mut self, timestep: usize, timesteps_reused: usize) {
    self.columns.retain(|(_, tag)| tag + timesteps_reused >= timestep);
  }

  pub fn clear(&mut self) {
    self.columns.clear();
  }
}

/// Construction parameters shared by the quasi-Newton variants.
pub struct QuasiNewtonSettings {
  pub initial_relaxation: f64,
  pub max_used_iterations: usize,
  pub timesteps_reused: usize,
  pub data_ids: Vec<DataId>,
}

pub struct IqnIlsAcceleration {
  initial_relaxation: f64,
  max_used_iterations: usize,
  timesteps_reused: usize,
  data_ids: SmallVec<[DataId; 2]>,
  intra: Rc<IntraComm>,

  v: DifferenceHistory,
  w: DifferenceHistory,
  old_residual: Option<DVector<f64>>,
  old_xtilde: Option<DVector<f64>>,
  design_specification: Vec<f64>,
  timestep: usize,
}

impl IqnIlsAcceleration {
  pub fn new(settings: QuasiNewtonSettings, intra: Rc<IntraComm>) -> Result<Self> {
    validate_settings(&settings)?;
    Ok(Self {
      initial_relaxation: settings.initial_relaxation,
      max_used_iterations: settings.max_used_iterations,
      timesteps_reused: settings.timesteps_reused,
      data_ids: settings.data_ids.into_iter().collect(),
      intra,
      v: DifferenceHistory::new(settings.max_used_iterations),
      w: DifferenceHistory::new(settings.max_used_iterations),
      old_residual: None,
      old_xtilde: None,
      design_specification: Vec::new(),
      timestep: 0,
    })
  }

  fn underrelax(&self, values: &[f64], old: &[f64]) -> Vec<f64> {
    let omega = self.initial_relaxation;
    values.iter().zip(old.iter()).map(|(v, o)| omega * v + (1.0 - omega) * o).collect()
  }
}

pub(crate) fn validate_settings(settings: &QuasiNewtonSettings) -> Result<()> {
  if settings.initial_relaxation <= 0.0 || settings.initial_relaxation > 1.0 {
    return Err(CoupleError::Config(format!(
      "initial relaxation factor for quasi-Newton has to be in (0; 1], got {}",
      settings.initial_relaxation
    )));
  }
  if settings.max_used_iterations == 0 {
    return Err(CoupleError::Config("quasi-Newton needs max-used-iterations >= 1".into()));
  }
  if settings.data_ids.is_empty() {
    return Err(CoupleError::Config("quasi-Newton needs at least one data field".into()));
  }
  Ok(())
}

/// Records the newest residual/value difference pair, shared by the
/// quasi-Newton variants.
pub(crate) fn update_difference_histories(
  residual: &DVector<f64>,
  xtilde: &DVector<f64>,
  old_residual: &mut Option<DVector<f64>>,
  old_xtilde: &mut Option<DVector<f64>>,
  v: &mut DifferenceHistory,
  w: &mut DifferenceHistory,
  timestep: usize,
) {
  if let (Some(prev_r), Some(prev_x)) = (old_residual.as_ref(), old_xtilde.as_ref()) {
    v.push(residual - prev_r, timestep);
    w.push(xtilde - prev_x, timestep);
  }
  *old_residual = Some(residual.clone());
  *old_xtilde = Some(xtilde.clone());
}

/// Distributed normal-equation solve of `min || V c + rhs ||`; `None` on a
/// singular system.
pub(crate) fn solve_least_squares(
  v: &DifferenceHistory,
  rhs: &DVector<f64>,
  intra: &IntraComm,
) -> Result<Option<DVector<f64>>> {
  let m = v.len();
  let mut normal = DMatrix::zeros(m, m);
  let mut b = DVector::zeros(m);
  for i in 0..m {
    for j in i..m {
      let entry = intra.dot(v.column(i).as_slice(), v.column(j).as_slice())?;
      normal[(i, j)] = entry;
      normal[(j, i)] = entry;
    }
    b[i] = -intra.dot(v.column(i).as_slice(), rhs.as_slice())?;
  }
  let solution = normal.lu().solve(&b);
  Ok(solution.filter(|c| c.iter().all(|x| x.is_finite())))
}

impl Acceleration for IqnIlsAcceleration {
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
    let values = DVector::from_vec(concat_values(&self.data_ids, data));
    let old = DVector::from_vec(concat_old(&self.data_ids, data));
    let residual = &values - &old;

    update_difference_histories(
      &residual,
      &values,
      &mut self.old_residual,
      &mut self.old_xtilde,
      &mut self.v,
      &mut self.w,
      self.timestep,
    );

    if self.v.is_empty() {
      // No secant information yet in this run: plain relaxation.
      let relaxed = self.underrelax(values.as_slice(), old.as_slice());
      write_back(&self.data_ids, data, &relaxed);
      return Ok(());
    }

    let q = DVector::from_column_slice(&self.design_specification);
    let rhs = &residual - &q;
    let updated = match solve_least_squares(&self.v, &rhs, &self.intra)? {
      Some(coefficients) => {
        debug!(columns = self.v.len(), "quasi-Newton least-squares update");
        let rows = values.len();
        let update = self.w.as_matrix(rows) * &coefficients;
        &values + &update
      }
      None => {
        warn!("singular least-squares system, falling back to relaxation for this iteration");
        DVector::from_vec(self.underrelax(values.as_slice(), old.as_slice()))
      }
    };
    write_back(&self.data_ids, data, updated.as_slice());
    Ok(())
  }

  fn iterations_converged(&mut self, _data: &DataMap) -> Result<()> {
    self.old_residual = None;
    self.old_xtilde = None;
    self.timestep += 1;
    if self.timesteps_reused == 0 {
      self.v.clear();
      self.w.clear();
    } else {
      self.v.retire(self.timestep, self.timesteps_reused);
      self.w.retire(self.timestep, self.timesteps_reused);
    }
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
#[path = "iqn_test.rs"]
mod iqn_test;
