//! Numerical constants shared across the engine.

/// Difference below which two simulation times are considered equal.
///
/// Used by the timestep bookkeeping to decide whether the current timestep
/// remainder has been fully consumed by the solver.
pub const NUMERICAL_ZERO: f64 = 1.0e-14;

/// Returns true if `a` and `b` agree up to [`NUMERICAL_ZERO`].
#[inline]
pub fn time_equals(a: f64, b: f64) -> bool {
  (a - b).abs() <= NUMERICAL_ZERO
}

/// Returns true if `a` is greater than `b` beyond [`NUMERICAL_ZERO`].
#[inline]
pub fn time_greater(a: f64, b: f64) -> bool {
  a - b > NUMERICAL_ZERO
}
