//! Two-participant coupling schemes.
//!
//! One implementation covers the four configured variants:
//!
//! * arrangement *serial*: the first participant sends before it receives,
//!   the second receives before it sends (staggered execution);
//! * arrangement *parallel*: both participants post their sends first
//!   (simultaneous execution);
//! * mode *explicit*: one exchange per timestep, always completing it;
//! * mode *implicit*: fixed-point iteration per timestep. The second
//!   participant evaluates the convergence measures, runs the configured
//!   acceleration and reports the verdict to the first over the master
//!   channel.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::com::IntraComm;
use crate::cplscheme::base::BaseCouplingScheme;
use crate::cplscheme::data::PtrCouplingData;
use crate::cplscheme::{Action, CouplingScheme};
use crate::error::{CoupleError, Result};
use crate::m2n::M2N;

/// Execution order of the two participants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arrangement {
  Serial,
  Parallel,
}

/// Temporal coupling mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
  Explicit,
  Implicit,
}

/// Construction parameters of a bilateral scheme.
pub struct BilateralConfig {
  pub first_participant: String,
  pub second_participant: String,
  pub local_participant: String,
  pub arrangement: Arrangement,
  pub mode: Mode,
  pub timestep_length: Option<f64>,
  pub max_time: Option<f64>,
  pub max_timesteps: Option<usize>,
}

/// Coupling scheme between exactly two participants.
pub struct BilateralCouplingScheme {
  base: BaseCouplingScheme,
  m2n: Rc<RefCell<M2N>>,
  first_participant: String,
  second_participant: String,
  arrangement: Arrangement,
  mode: Mode,
}

impl BilateralCouplingScheme {
  pub fn new(config: BilateralConfig, m2n: Rc<RefCell<M2N>>, intra: Rc<IntraComm>) -> Self {
    assert!(
      config.local_participant == config.first_participant
        || config.local_participant == config.second_participant,
      "local participant takes part in its own scheme"
    );
    let base = BaseCouplingScheme::new(
      config.local_participant,
      intra,
      config.timestep_length,
      config.max_time,
      config.max_timesteps,
    );
    Self {
      base,
      m2n,
      first_participant: config.first_participant,
      second_participant: config.second_participant,
      arrangement: config.arrangement,
      mode: config.mode,
    }
  }

  /// Mutable access to the shared engine for configuration-time wiring
  /// (data bindings, measures, acceleration, limits).
  pub fn base_mut(&mut self) -> &mut BaseCouplingScheme {
    &mut self.base
  }

  pub fn base(&self) -> &BaseCouplingScheme {
    &self.base
  }

  fn does_first_step(&self) -> bool {
    self.base.local_participant == self.first_participant
  }

  fn remote_participant(&self) -> &str {
    if self.does_first_step() {
      &self.second_participant
    } else {
      &self.first_participant
    }
  }

  // ---------------------------------------------------------------------
  // Exchange helpers
  // ---------------------------------------------------------------------

  fn send_cells(&self, cells: &[PtrCouplingData]) -> Result<()> {
    let mut m2n = self.m2n.borrow_mut();
    for cell in cells {
      let cell = cell.borrow();
      let mesh_id = cell.mesh.borrow().id();
      trace!(data = ?cell.id(), len = cell.len(), "sending field");
      m2n.send(&cell.values(), mesh_id, cell.dimensions())?;
    }
    Ok(())
  }

  fn receive_cells(&mut self, cells: &[PtrCouplingData]) -> Result<()> {
    let mut m2n = self.m2n.borrow_mut();
    for cell in cells {
      let cell = cell.borrow();
      let mesh_id = cell.mesh.borrow().id();
      let mut values = vec![0.0; cell.len()];
      m2n.receive(&mut values, mesh_id, cell.dimensions())?;
      trace!(data = ?cell.id(), len = values.len(), "received field");
      cell.set_values(&values);
    }
    if !cells.is_empty() {
      self.base.data_exchanged = true;
    }
    Ok(())
  }

  fn all_send_cells(&self) -> Vec<PtrCouplingData> {
    self.base.send_data.values().cloned().collect()
  }

  fn all_receive_cells(&self) -> Vec<PtrCouplingData> {
    self.base.receive_data.values().cloned().collect()
  }

  /// Without a configured timestep length the first participant prescribes
  /// the step; the value travels over the master channel as a diagnostic.
  fn exchange_free_timestep_length(&self) -> Result<()> {
    if self.base.timestep_length.is_some() || self.arrangement != Arrangement::Serial {
      return Ok(());
    }
    let intra = &self.base.intra;
    if self.does_first_step() {
      if !intra.is_slave() {
        self.m2n.borrow().send_f64_master(self.base.computed_timestep_part)?;
      }
    } else {
      let mut dt = 0.0;
      if !intra.is_slave() {
        dt = self.m2n.borrow().recv_f64_master()?;
      }
      intra.broadcast_f64(&mut dt)?;
      debug!(dt, "first participant prescribed timestep length");
    }
    Ok(())
  }

  /// Receives the aggregated convergence verdict from the second
  /// participant and fans it out to the local slaves.
  fn receive_convergence(&self) -> Result<bool> {
    let intra = &self.base.intra;
    let mut converged = false;
    if !intra.is_slave() {
      converged = self.m2n.borrow().recv_bool_master()?;
    }
    intra.broadcast_bool(&mut converged)?;
    Ok(converged)
  }

  fn send_convergence(&self, converged: bool) -> Result<()> {
    if !self.base.intra.is_slave() {
      self.m2n.borrow().send_bool_master(converged)?;
    }
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Advance variants
  // ---------------------------------------------------------------------

  fn explicit_advance(&mut self) -> Result<()> {
    match self.arrangement {
      Arrangement::Serial => {
        if self.does_first_step() {
          self.exchange_free_timestep_length()?;
          self.send_cells(&self.all_send_cells())?;
          self.receive_cells(&self.all_receive_cells())?;
        } else {
          self.exchange_free_timestep_length()?;
          self.receive_cells(&self.all_receive_cells())?;
          self.send_cells(&self.all_send_cells())?;
        }
      }
      Arrangement::Parallel => {
        self.send_cells(&self.all_send_cells())?;
        self.receive_cells(&self.all_receive_cells())?;
      }
    }
    if !self.base.send_data.is_empty() {
      self.base.data_exchanged = true;
    }
    self.base.complete_timestep(false);
    Ok(())
  }

  fn implicit_advance(&mut self) -> Result<()> {
    if self.does_first_step() {
      self.exchange_free_timestep_length()?;
      self.send_cells(&self.all_send_cells())?;
      let converged = self.receive_convergence()?;
      self.receive_cells(&self.all_receive_cells())?;
      if converged {
        self.base.complete_timestep(true);
      } else {
        self.base.repeat_timestep();
      }
    } else {
      self.exchange_free_timestep_length()?;
      self.receive_cells(&self.all_receive_cells())?;
      let converged = self.base.measure_convergence()?;
      if converged {
        if let Some(acceleration) = self.base.acceleration.as_mut() {
          acceleration.iterations_converged(&self.base.all_data)?;
        }
      } else if let Some(acceleration) = self.base.acceleration.as_mut() {
        acceleration.perform(&self.base.all_data)?;
      }
      self.send_convergence(converged)?;
      self.send_cells(&self.all_send_cells())?;
      if converged {
        self.base.complete_timestep(true);
      } else {
        self.base.update_old_values();
        self.base.repeat_timestep();
      }
    }
    if !self.base.send_data.is_empty() {
      self.base.data_exchanged = true;
    }
    Ok(())
  }
}

impl CouplingScheme for BilateralCouplingScheme {
  fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
    if self.mode == Mode::Implicit && self.base.measures.is_empty() {
      return Err(CoupleError::Config(
        "implicit coupling needs at least one convergence measure".into(),
      ));
    }
    self.base.initialize_base(start_time, start_timestep)?;
    if self.mode == Mode::Implicit {
      self.base.require_action(Action::WriteIterationCheckpoint);
    }
    self.base.new_measurement_series();
    Ok(())
  }

  fn is_initialized(&self) -> bool {
    self.base.initialized
  }

  fn initialize_data(&mut self) -> Result<()> {
    self.base.check_initialized()?;
    if self.base.is_action_required(Action::WriteInitialData) {
      return Err(CoupleError::RequiredAction(Action::WriteInitialData.name().to_string()));
    }
    let send_init = self.base.send_init_cells();
    let receive_init = self.base.receive_init_cells();
    if self.does_first_step() {
      self.send_cells(&send_init)?;
      self.receive_cells(&receive_init)?;
    } else {
      self.receive_cells(&receive_init)?;
      self.send_cells(&send_init)?;
    }
    self.base.baseline_initialized_data();
    Ok(())
  }

  fn add_computed_time(&mut self, dt: f64) -> Result<()> {
    self.base.check_initialized()?;
    self.base.add_computed_time_base(dt)
  }

  fn advance(&mut self) -> Result<()> {
    self.base.check_initialized()?;
    self.base.check_actions_fulfilled()?;
    self.base.check_timestep_consumed()?;
    self.base.data_exchanged = false;
    self.base.timestep_complete = false;
    match self.mode {
      Mode::Explicit => self.explicit_advance(),
      Mode::Implicit => self.implicit_advance(),
    }
  }

  fn finalize(&mut self) -> Result<()> {
    self.base.check_initialized()?;
    debug!(participant = %self.base.local_participant, "coupling scheme finalized");
    Ok(())
  }

  fn coupling_partners(&self) -> Vec<String> {
    vec![self.remote_participant().to_string()]
  }

  fn time(&self) -> f64 {
    self.base.time
  }

  fn timesteps(&self) -> usize {
    self.base.timesteps
  }

  fn max_time(&self) -> Option<f64> {
    self.base.max_time
  }

  fn max_timesteps(&self) -> Option<usize> {
    self.base.max_timesteps
  }

  fn has_timestep_length(&self) -> bool {
    self.base.timestep_length.is_some()
  }

  fn timestep_length(&self) -> Option<f64> {
    self.base.timestep_length
  }

  fn this_timestep_remainder(&self) -> f64 {
    self.base.this_timestep_remainder()
  }

  fn computed_timestep_part(&self) -> f64 {
    self.base.computed_timestep_part
  }

  fn next_timestep_max_length(&self) -> f64 {
    self.base.next_timestep_max_length()
  }

  fn is_coupling_ongoing(&self) -> bool {
    self.base.is_coupling_ongoing_base()
  }

  fn is_coupling_timestep_complete(&self) -> bool {
    self.base.timestep_complete
  }

  fn has_data_been_exchanged(&self) -> bool {
    self.base.data_exchanged
  }

  fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool {
    self.base.will_data_be_exchanged_base(last_solver_dt)
  }

  fn is_action_required(&self, action: Action) -> bool {
    self.base.is_action_required(action)
  }

  fn performed_action(&mut self, action: Action) {
    self.base.performed_action(action)
  }

  fn require_action(&mut self, action: Action) {
    self.base.require_action(action)
  }

  fn checkpoint_timestep_interval(&self) -> Option<usize> {
    self.base.checkpoint_interval
  }

  fn print_coupling_state(&self) -> String {
    self.base.print_state(self.mode == Mode::Implicit)
  }

  fn export_state(&self, prefix: &str) -> Result<()> {
    self.base.export_to(prefix)
  }

  fn import_state(&mut self, prefix: &str) -> Result<()> {
    self.base.import_from(prefix)
  }
}

#[cfg(test)]
#[path = "bilateral_test.rs"]
mod bilateral_test;
