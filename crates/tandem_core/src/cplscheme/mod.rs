//! Coupling schemes: the state machines driving lock-step time stepping.
//!
//! A scheme owns time and timestep bookkeeping, the send/receive data
//! bindings towards its coupling partner(s), iteration control with
//! convergence measures and optional acceleration, and the named *action*
//! flags through which it asks the solver to checkpoint or restore state.
//!
//! ```text
//! Constructed --initialize--> Initialized --advance--> (Stepping <-> Iterating)
//!                                                           |
//!                                                        finalize
//! ```
//!
//! Explicit schemes exchange once per timestep and always complete it;
//! implicit schemes iterate the same timestep until every configured
//! convergence measure holds, asking the solver to rewind via the
//! iteration-checkpoint actions in between.

use std::fmt;

use crate::error::Result;

pub mod base;
pub mod bilateral;
pub mod checkpoint;
pub mod composition;
pub mod convergence;
pub mod data;
pub mod multi;

#[cfg(test)]
pub mod test_utils;

pub use base::BaseCouplingScheme;
pub use bilateral::{Arrangement, BilateralCouplingScheme, Mode};
pub use checkpoint::SimulationState;
pub use composition::CompositionalCouplingScheme;
pub use convergence::ConvergenceMeasure;
pub use data::{CouplingData, DataMap, PtrCouplingData};
pub use multi::MultiCouplingScheme;

/// Named request from the scheme to the solver, cleared once the solver
/// reports it performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
  /// Save solver state so a non-converged iteration can rewind to it.
  WriteIterationCheckpoint,
  /// Restore solver state saved by the matching write.
  ReadIterationCheckpoint,
  /// Provide initial data values before the first exchange.
  WriteInitialData,
  /// Persist the full simulation state to disk.
  WriteSimulationCheckpoint,
  /// Restore the full simulation state from disk.
  ReadSimulationCheckpoint,
}

impl Action {
  pub fn name(&self) -> &'static str {
    match self {
      Action::WriteIterationCheckpoint => "write-iteration-checkpoint",
      Action::ReadIterationCheckpoint => "read-iteration-checkpoint",
      Action::WriteInitialData => "write-initial-data",
      Action::WriteSimulationCheckpoint => "write-simulation-checkpoint",
      Action::ReadSimulationCheckpoint => "read-simulation-checkpoint",
    }
  }
}

impl fmt::Display for Action {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Common surface of every coupling scheme, including the compositional one.
pub trait CouplingScheme {
  /// Transitions from Constructed to Initialized at the given start state.
  fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()>;

  fn is_initialized(&self) -> bool;

  /// Performs the configured initial-data exchange; legal only after
  /// `initialize` and after a required `write-initial-data` was performed.
  fn initialize_data(&mut self) -> Result<()>;

  /// Books solver progress within the current timestep.
  fn add_computed_time(&mut self, dt: f64) -> Result<()>;

  /// Exchanges data and advances the state machine by one step/iteration.
  fn advance(&mut self) -> Result<()>;

  /// Terminal transition; closes nothing by itself but seals bookkeeping.
  fn finalize(&mut self) -> Result<()>;

  /// Names of the remote participants this scheme couples with.
  fn coupling_partners(&self) -> Vec<String>;

  fn time(&self) -> f64;
  fn timesteps(&self) -> usize;
  fn max_time(&self) -> Option<f64>;
  fn max_timesteps(&self) -> Option<usize>;
  fn has_timestep_length(&self) -> bool;
  fn timestep_length(&self) -> Option<f64>;
  fn this_timestep_remainder(&self) -> f64;
  fn computed_timestep_part(&self) -> f64;
  fn next_timestep_max_length(&self) -> f64;
  fn is_coupling_ongoing(&self) -> bool;
  fn is_coupling_timestep_complete(&self) -> bool;
  fn has_data_been_exchanged(&self) -> bool;
  fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool;

  fn is_action_required(&self, action: Action) -> bool;
  fn performed_action(&mut self, action: Action);
  fn require_action(&mut self, action: Action);

  fn checkpoint_timestep_interval(&self) -> Option<usize>;

  /// One-line human-readable state summary.
  fn print_coupling_state(&self) -> String;

  /// Serializes scheme state to `<prefix>_cplscheme.txt`.
  fn export_state(&self, prefix: &str) -> Result<()>;

  /// Restores scheme state written by [`CouplingScheme::export_state`].
  fn import_state(&mut self, prefix: &str) -> Result<()>;
}
