use approx::assert_relative_eq;

use super::*;
use crate::com::IntraComm;

fn serial() -> IntraComm {
  IntraComm::serial()
}

/// Absolute: converged exactly when the difference norm is at or below the
/// limit.
#[test]
fn test_absolute_measure() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::absolute(0.5).unwrap();
  measure.new_measurement_series(&[0.0]);

  measure.measure(&[1.0], &[2.0], &[0.0], &intra).unwrap();
  assert!(!measure.is_convergence());

  measure.measure(&[1.0], &[1.4], &[0.0], &intra).unwrap();
  assert!(measure.is_convergence());
}

/// Relative: limit scales with the norm of the new values.
#[test]
fn test_relative_measure() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::relative(0.1).unwrap();
  measure.new_measurement_series(&[0.0]);

  // diff 1 vs scale 10: exactly at the limit.
  measure.measure(&[9.0], &[10.0], &[0.0], &intra).unwrap();
  assert!(measure.is_convergence());

  measure.measure(&[5.0], &[10.0], &[0.0], &intra).unwrap();
  assert!(!measure.is_convergence());
}

/// Residual-relative: compares against the first residual of the series.
#[test]
fn test_residual_relative_measure() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::residual_relative(0.25).unwrap();
  measure.new_measurement_series(&[0.0]);

  // First measurement fixes the reference; never converged on its own
  // unless the residual is zero.
  measure.measure(&[0.0], &[8.0], &[0.0], &intra).unwrap();
  assert!(!measure.is_convergence());

  // 1.9 <= 0.25 * 8.
  measure.measure(&[0.0], &[1.9], &[0.0], &intra).unwrap();
  assert!(measure.is_convergence());

  // A new series resets the reference.
  measure.new_measurement_series(&[0.0]);
  measure.measure(&[0.0], &[1.9], &[0.0], &intra).unwrap();
  assert!(!measure.is_convergence());
}

/// WRMS: weights come from the old values of the series start.
#[test]
fn test_weighted_rms_measure() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::weighted_rms(0.1, 0.1).unwrap();
  // Old values 1.0 -> weight 1 / (0.1 + 0.1) = 5.
  measure.new_measurement_series(&[1.0, 1.0]);

  // diff 0.1 each: wrms = sqrt(((0.5)^2 * 2) / 2) = 0.5 <= 1.
  measure.measure(&[1.0, 1.0], &[1.1, 1.1], &[0.0, 0.0], &intra).unwrap();
  assert!(measure.is_convergence());

  // diff 0.3 each: wrms = 1.5 > 1.
  measure.measure(&[1.0, 1.0], &[1.3, 1.3], &[0.0, 0.0], &intra).unwrap();
  assert!(!measure.is_convergence());
}

/// Scaling a residual by a < 1 scales the WRMS norm by exactly a.
#[test]
fn test_weighted_rms_scales_linearly() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::weighted_rms(0.2, 0.05).unwrap();
  measure.new_measurement_series(&[2.0, -1.0, 0.5]);

  measure.measure(&[0.0, 0.0, 0.0], &[0.4, -0.2, 0.6], &[0.0; 3], &intra).unwrap();
  let full = match &measure {
    ConvergenceMeasure::WeightedRms { last_norm, .. } => *last_norm,
    _ => unreachable!(),
  };

  measure.measure(&[0.0, 0.0, 0.0], &[0.2, -0.1, 0.3], &[0.0; 3], &intra).unwrap();
  let halved = match &measure {
    ConvergenceMeasure::WeightedRms { last_norm, .. } => *last_norm,
    _ => unreachable!(),
  };
  assert_relative_eq!(halved, full * 0.5, max_relative = 1e-12);
}

/// The design specification shifts the residual before the norm.
#[test]
fn test_design_specification_shift() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::absolute(1e-12).unwrap();
  measure.new_measurement_series(&[0.0]);

  // new - old = 3, q = 3: converged despite the large raw difference.
  measure.measure(&[1.0], &[4.0], &[3.0], &intra).unwrap();
  assert!(measure.is_convergence());
}

/// Non-finite residuals are fatal.
#[test]
fn test_diverged_residual() {
  let intra = serial();
  let mut measure = ConvergenceMeasure::absolute(1.0).unwrap();
  measure.new_measurement_series(&[0.0]);
  match measure.measure(&[0.0], &[f64::NAN], &[0.0], &intra) {
    Err(CoupleError::DivergedResidual) => {}
    other => panic!("expected DivergedResidual, got {other:?}"),
  }
}

/// Out-of-range limits are configuration errors.
#[test]
fn test_invalid_limits() {
  assert!(matches!(ConvergenceMeasure::relative(0.0), Err(CoupleError::Config(_))));
  assert!(matches!(ConvergenceMeasure::relative(1.5), Err(CoupleError::Config(_))));
  assert!(matches!(ConvergenceMeasure::absolute(-1.0), Err(CoupleError::Config(_))));
}
