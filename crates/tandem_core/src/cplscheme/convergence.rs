//! Convergence measures for implicit iteration control.
//!
//! Every measure compares the previous iterate against the current one,
//! optionally shifted by a design-specification target, using the
//! distributed norms of [`IntraComm`]. A scheme holds an ordered set of
//! measures and declares convergence only when all of them do.

use tracing::debug;

use crate::com::IntraComm;
use crate::error::{CoupleError, Result};

/// Measures the distance from an old data set to a new one.
pub enum ConvergenceMeasure {
  /// `||new - old - q|| <= limit`.
  Absolute { limit: f64, last_norm: f64, converged: bool },
  /// `||new - old - q|| <= limit * ||new||`, `limit` in (0, 1].
  Relative { limit: f64, last_norm: f64, converged: bool },
  /// Ratio against the first residual of the current measurement series.
  ResidualRelative { limit: f64, first_norm: Option<f64>, last_norm: f64, converged: bool },
  /// Weighted RMS with weights `1 / (|old_i| * rel + abs)`, converged at 1.
  WeightedRms { rel_tol: f64, abs_tol: f64, weights: Vec<f64>, last_norm: f64, converged: bool },
}

impl ConvergenceMeasure {
  pub fn absolute(limit: f64) -> Result<Self> {
    if limit <= 0.0 {
      return Err(CoupleError::Config(format!(
        "absolute convergence limit has to be positive, got {limit}"
      )));
    }
    Ok(ConvergenceMeasure::Absolute { limit, last_norm: 0.0, converged: false })
  }

  pub fn relative(limit: f64) -> Result<Self> {
    if limit <= 0.0 || limit > 1.0 {
      return Err(CoupleError::Config(format!(
        "relative convergence limit has to be in (0; 1], got {limit}"
      )));
    }
    Ok(ConvergenceMeasure::Relative { limit, last_norm: 0.0, converged: false })
  }

  pub fn residual_relative(limit: f64) -> Result<Self> {
    if limit <= 0.0 || limit > 1.0 {
      return Err(CoupleError::Config(format!(
        "residual-relative convergence limit has to be in (0; 1], got {limit}"
      )));
    }
    Ok(ConvergenceMeasure::ResidualRelative {
      limit,
      first_norm: None,
      last_norm: 0.0,
      converged: false,
    })
  }

  pub fn weighted_rms(rel_tol: f64, abs_tol: f64) -> Result<Self> {
    if rel_tol < 0.0 || abs_tol < 0.0 || (rel_tol == 0.0 && abs_tol == 0.0) {
      return Err(CoupleError::Config(
        "weighted-rms tolerances have to be non-negative and not both zero".into(),
      ));
    }
    Ok(ConvergenceMeasure::WeightedRms {
      rel_tol,
      abs_tol,
      weights: Vec::new(),
      last_norm: 0.0,
      converged: false,
    })
  }

  /// Resets the measure at the beginning of a new timestep. The weighted
  /// RMS variant derives its weights from the last converged values.
  pub fn new_measurement_series(&mut self, old_values: &[f64]) {
    match self {
      ConvergenceMeasure::Absolute { converged, .. }
      | ConvergenceMeasure::Relative { converged, .. } => *converged = false,
      ConvergenceMeasure::ResidualRelative { first_norm, converged, .. } => {
        *first_norm = None;
        *converged = false;
      }
      ConvergenceMeasure::WeightedRms { rel_tol, abs_tol, weights, converged, .. } => {
        weights.clear();
        weights.extend(old_values.iter().map(|v| 1.0 / (v.abs() * *rel_tol + *abs_tol)));
        *converged = false;
      }
    }
  }

  /// Records one measurement of `new` against `old`, shifted by the design
  /// specification `q`. A non-finite norm is a diverged residual.
  pub fn measure(
    &mut self,
    old_values: &[f64],
    new_values: &[f64],
    design_spec: &[f64],
    intra: &IntraComm,
  ) -> Result<()> {
    debug_assert_eq!(old_values.len(), new_values.len());
    let diff: Vec<f64> = new_values
      .iter()
      .zip(old_values.iter())
      .enumerate()
      .map(|(i, (n, o))| n - o - design_spec.get(i).copied().unwrap_or(0.0))
      .collect();

    match self {
      ConvergenceMeasure::Absolute { limit, last_norm, converged } => {
        let norm = intra.l2norm(&diff)?;
        Self::check_finite(norm)?;
        *last_norm = norm;
        *converged = norm <= *limit;
      }
      ConvergenceMeasure::Relative { limit, last_norm, converged } => {
        let norm = intra.l2norm(&diff)?;
        let scale = intra.l2norm(new_values)?;
        Self::check_finite(norm)?;
        *last_norm = norm;
        *converged = norm <= *limit * scale;
      }
      ConvergenceMeasure::ResidualRelative { limit, first_norm, last_norm, converged } => {
        let norm = intra.l2norm(&diff)?;
        Self::check_finite(norm)?;
        let reference = *first_norm.get_or_insert(norm);
        *last_norm = norm;
        *converged = norm <= *limit * reference;
      }
      ConvergenceMeasure::WeightedRms { weights, last_norm, converged, .. } => {
        debug_assert_eq!(weights.len(), diff.len());
        let norm = intra.wrms_norm(&diff, weights)?;
        Self::check_finite(norm)?;
        *last_norm = norm;
        *converged = norm <= 1.0;
      }
    }
    debug!(state = %self.print_state(), "measured convergence");
    Ok(())
  }

  fn check_finite(norm: f64) -> Result<()> {
    if !norm.is_finite() {
      return Err(CoupleError::DivergedResidual);
    }
    Ok(())
  }

  pub fn is_convergence(&self) -> bool {
    match self {
      ConvergenceMeasure::Absolute { converged, .. }
      | ConvergenceMeasure::Relative { converged, .. }
      | ConvergenceMeasure::ResidualRelative { converged, .. }
      | ConvergenceMeasure::WeightedRms { converged, .. } => *converged,
    }
  }

  pub fn print_state(&self) -> String {
    match self {
      ConvergenceMeasure::Absolute { limit, last_norm, converged } => {
        format!("absolute diff = {last_norm:.3e}, limit = {limit:.3e}, conv = {converged}")
      }
      ConvergenceMeasure::Relative { limit, last_norm, converged } => {
        format!("relative diff = {last_norm:.3e}, limit = {limit:.3e}, conv = {converged}")
      }
      ConvergenceMeasure::ResidualRelative { limit, first_norm, last_norm, converged } => format!(
        "residual-relative diff = {last_norm:.3e}, first = {:.3e}, limit = {limit:.3e}, conv = {converged}",
        first_norm.unwrap_or(0.0)
      ),
      ConvergenceMeasure::WeightedRms { last_norm, converged, .. } => {
        format!("wrms diff = {last_norm:.3e}, limit = 1.0, conv = {converged}")
      }
    }
  }
}

#[cfg(test)]
#[path = "convergence_test.rs"]
mod convergence_test;
