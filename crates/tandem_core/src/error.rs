//! Error kinds shared across the coupling engine.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoupleError>;

/// Fatal error conditions of the coupling engine.
///
/// Two further conditions are deliberately *not* represented here because
/// they are recoverable and surface as `tracing::warn!` diagnostics instead:
/// reaching the iteration limit (forced convergence) and a singular
/// quasi-Newton system (fallback to plain relaxation for the iteration).
#[derive(Debug, Error)]
pub enum CoupleError {
  /// Invalid configuration constant or combination.
  #[error("invalid configuration: {0}")]
  Config(String),

  /// Operation on a channel that has not completed connection setup.
  #[error("operation on unconnected channel: {0}")]
  NotConnected(String),

  /// Duplicate connection setup on the same channel.
  #[error("connection already established: {0}")]
  AlreadyConnected(String),

  /// Caller-supplied buffer length disagrees with the vertex distribution.
  #[error("buffer of {got} values does not match distribution size {expected}")]
  SizeMismatch { expected: usize, got: usize },

  /// Exchange attempted before distributions were exchanged for the mesh.
  #[error("exchange before distributed channel setup: {0}")]
  NotReady(String),

  /// Underlying send or receive failed; the channel state is indeterminate.
  #[error("transport failure: {0}")]
  Transport(String),

  /// `advance` was called while the current timestep is incomplete.
  #[error("advance with remaining timestep length {0:.6e}")]
  WouldOvershoot(f64),

  /// A residual norm became NaN or infinite.
  #[error("residual diverged (non-finite norm)")]
  DivergedResidual,

  /// An asynchronous request was left un-waited at channel closure.
  #[error("pending request left un-waited at channel closure")]
  PendingRequest,

  /// A required action was not performed before the next `advance`.
  #[error("required action not fulfilled before advance: {0}")]
  RequiredAction(String),

  /// Checkpoint file input/output failed.
  #[error("checkpoint i/o: {0}")]
  Io(#[from] std::io::Error),
}
