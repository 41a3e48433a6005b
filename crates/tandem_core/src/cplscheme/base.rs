//! Shared engine of the concrete coupling schemes.
//!
//! [`BaseCouplingScheme`] owns everything that serial, parallel and
//! multi-participant schemes have in common: time and timestep bookkeeping,
//! iteration counters, the send/receive data maps, convergence evaluation,
//! the acceleration hook, the action flags and the checkpoint text format.
//! The concrete schemes add only their exchange choreography.

use std::collections::HashSet;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::acceleration::Acceleration;
use crate::com::IntraComm;
use crate::constants::{time_greater, NUMERICAL_ZERO};
use crate::cplscheme::checkpoint::KeyValueFile;
use crate::cplscheme::convergence::ConvergenceMeasure;
use crate::cplscheme::data::{CouplingData, DataMap, PtrCouplingData};
use crate::cplscheme::Action;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;
use crate::mesh::{PtrData, PtrMesh};

/// A convergence measure bound to one data field.
pub struct MeasureContext {
  pub data_id: DataId,
  pub measure: ConvergenceMeasure,
}

/// State shared by all concrete coupling schemes.
pub struct BaseCouplingScheme {
  pub(crate) local_participant: String,
  pub(crate) intra: Rc<IntraComm>,

  pub(crate) time: f64,
  pub(crate) timesteps: usize,
  pub(crate) computed_timestep_part: f64,
  pub(crate) timestep_length: Option<f64>,
  pub(crate) max_time: Option<f64>,
  pub(crate) max_timesteps: Option<usize>,

  pub(crate) iterations: usize,
  pub(crate) total_iterations: usize,
  pub(crate) min_iterations: Option<usize>,
  pub(crate) max_iterations: Option<usize>,
  pub(crate) extrapolation_order: usize,
  pub(crate) checkpoint_interval: Option<usize>,

  pub(crate) send_data: DataMap,
  pub(crate) receive_data: DataMap,
  pub(crate) all_data: DataMap,
  pub(crate) measures: Vec<MeasureContext>,
  pub(crate) acceleration: Option<Box<dyn Acceleration>>,

  pub(crate) actions: HashSet<Action>,
  pub(crate) initialized: bool,
  pub(crate) timestep_complete: bool,
  pub(crate) data_exchanged: bool,
}

impl BaseCouplingScheme {
  pub fn new(
    local_participant: impl Into<String>,
    intra: Rc<IntraComm>,
    timestep_length: Option<f64>,
    max_time: Option<f64>,
    max_timesteps: Option<usize>,
  ) -> Self {
    Self {
      local_participant: local_participant.into(),
      intra,
      time: 0.0,
      timesteps: 0,
      computed_timestep_part: 0.0,
      timestep_length,
      max_time,
      max_timesteps,
      iterations: 1,
      total_iterations: 1,
      min_iterations: None,
      max_iterations: None,
      extrapolation_order: 0,
      checkpoint_interval: None,
      send_data: DataMap::new(),
      receive_data: DataMap::new(),
      all_data: DataMap::new(),
      measures: Vec::new(),
      acceleration: None,
      actions: HashSet::new(),
      initialized: false,
      timestep_complete: false,
      data_exchanged: false,
    }
  }

  // ---------------------------------------------------------------------
  // Configuration-time wiring
  // ---------------------------------------------------------------------

  pub fn add_send_data(&mut self, data: PtrData, mesh: PtrMesh, initialize: bool) {
    let cell = CouplingData::new(data, mesh, initialize);
    let id = cell.id();
    self.send_data.insert(id, Rc::new(std::cell::RefCell::new(cell)));
  }

  pub fn add_receive_data(&mut self, data: PtrData, mesh: PtrMesh, initialize: bool) {
    let cell = CouplingData::new(data, mesh, initialize);
    let id = cell.id();
    self.receive_data.insert(id, Rc::new(std::cell::RefCell::new(cell)));
  }

  pub fn add_convergence_measure(&mut self, data_id: DataId, measure: ConvergenceMeasure) {
    self.measures.push(MeasureContext { data_id, measure });
  }

  pub fn set_acceleration(&mut self, acceleration: Box<dyn Acceleration>) {
    self.acceleration = Some(acceleration);
  }

  pub fn set_iteration_limits(&mut self, min: Option<usize>, max: Option<usize>) {
    self.min_iterations = min;
    self.max_iterations = max;
  }

  pub fn set_extrapolation_order(&mut self, order: usize) {
    debug_assert!(order <= 2, "extrapolation order must be 0, 1 or 2");
    self.extrapolation_order = order;
  }

  pub fn set_checkpoint_interval(&mut self, interval: Option<usize>) {
    self.checkpoint_interval = interval;
  }

  // ---------------------------------------------------------------------
  // Lifecycle helpers
  // ---------------------------------------------------------------------

  /// Common part of `initialize`: seeds counters, sizes the old-value
  /// matrices and initializes the acceleration.
  pub(crate) fn initialize_base(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
    assert!(!self.initialized, "scheme initialized twice");
    self.time = start_time;
    self.timesteps = start_timestep;
    self.iterations = 1;
    self.total_iterations = 1;

    self.all_data = self
      .send_data
      .iter()
      .chain(self.receive_data.iter())
      .map(|(id, cell)| (*id, cell.clone()))
      .collect();

    let history_columns = self.extrapolation_order + 1;
    for cell in self.all_data.values() {
      cell.borrow_mut().ensure_old_columns(history_columns);
    }

    if let Some(acceleration) = self.acceleration.as_mut() {
      acceleration.initialize(&self.all_data)?;
    }

    if self.send_data.values().any(|cell| cell.borrow().requires_initialization) {
      self.require_action(Action::WriteInitialData);
    }

    self.initialized = true;
    info!(
      participant = %self.local_participant,
      time = self.time,
      timestep = self.timesteps,
      "coupling scheme initialized"
    );
    Ok(())
  }

  pub(crate) fn check_initialized(&self) -> Result<()> {
    if !self.initialized {
      return Err(CoupleError::Config("coupling scheme used before initialize".into()));
    }
    Ok(())
  }

  /// All required actions must be performed before the next advance.
  pub(crate) fn check_actions_fulfilled(&self) -> Result<()> {
    if let Some(action) = self.actions.iter().next() {
      return Err(CoupleError::RequiredAction(action.name().to_string()));
    }
    Ok(())
  }

  /// Advance is legal only once the solver consumed the whole timestep.
  pub(crate) fn check_timestep_consumed(&self) -> Result<()> {
    let remainder = self.this_timestep_remainder();
    if time_greater(remainder, 0.0) {
      return Err(CoupleError::WouldOvershoot(remainder));
    }
    Ok(())
  }

  pub(crate) fn add_computed_time_base(&mut self, dt: f64) -> Result<()> {
    debug_assert!(dt > 0.0, "computed time must be positive");
    if !self.is_coupling_ongoing_base() {
      warn!(participant = %self.local_participant, "computed time added while coupling is over");
    }
    if let Some(length) = self.timestep_length {
      let excess = self.computed_timestep_part + dt - length;
      if time_greater(excess, 0.0) {
        return Err(CoupleError::WouldOvershoot(excess));
      }
    }
    self.computed_timestep_part += dt;
    self.time += dt;
    Ok(())
  }

  // ---------------------------------------------------------------------
  // Queries
  // ---------------------------------------------------------------------

  pub(crate) fn this_timestep_remainder(&self) -> f64 {
    match self.timestep_length {
      Some(length) => length - self.computed_timestep_part,
      None => 0.0,
    }
  }

  pub(crate) fn next_timestep_max_length(&self) -> f64 {
    let mut limit = match self.timestep_length {
      Some(length) => length - self.computed_timestep_part,
      None => f64::MAX,
    };
    if let Some(max_time) = self.max_time {
      limit = limit.min(max_time - self.time);
    }
    limit
  }

  pub(crate) fn is_coupling_ongoing_base(&self) -> bool {
    let time_left = self.max_time.map_or(true, |max| time_greater(max, self.time));
    let steps_left = self.max_timesteps.map_or(true, |max| self.timesteps < max);
    time_left && steps_left
  }

  pub(crate) fn will_data_be_exchanged_base(&self, last_solver_dt: f64) -> bool {
    match self.timestep_length {
      Some(length) => {
        let remainder = length - self.computed_timestep_part - last_solver_dt;
        remainder <= NUMERICAL_ZERO
      }
      None => true,
    }
  }

  // ---------------------------------------------------------------------
  // Actions
  // ---------------------------------------------------------------------

  pub(crate) fn require_action(&mut self, action: Action) {
    self.actions.insert(action);
  }

  pub(crate) fn performed_action(&mut self, action: Action) {
    self.actions.remove(&action);
  }

  pub(crate) fn is_action_required(&self, action: Action) -> bool {
    self.actions.contains(&action)
  }

  // ---------------------------------------------------------------------
  // Convergence and iteration control
  // ---------------------------------------------------------------------

  /// Evaluates every configured measure; returns the aggregated verdict
  /// including min-iteration suppression and max-iteration forcing.
  pub(crate) fn measure_convergence(&mut self) -> Result<bool> {
    assert!(!self.measures.is_empty(), "implicit scheme without convergence measures");
    let specs = self
      .acceleration
      .as_ref()
      .map(|acceleration| acceleration.design_specification(&self.all_data))
      .unwrap_or_default();

    let mut all_converged = true;
    for context in &mut self.measures {
      let cell = self.all_data.get(&context.data_id).ok_or_else(|| {
        CoupleError::Config(format!("convergence measure on uncoupled data {:?}", context.data_id))
      })?;
      let (old_values, new_values) = {
        let cell = cell.borrow();
        (cell.old_column(), cell.values())
      };
      let empty = Vec::new();
      let spec = specs.get(&context.data_id).unwrap_or(&empty);
      context.measure.measure(&old_values, &new_values, spec, &self.intra)?;
      all_converged &= context.measure.is_convergence();
      info!(
        participant = %self.local_participant,
        state = %context.measure.print_state(),
        "convergence measure"
      );
    }

    if let Some(min) = self.min_iterations {
      if self.iterations < min {
        debug!(iterations = self.iterations, min, "convergence suppressed below min-iterations");
        all_converged = false;
      }
    }
    if !all_converged {
      if let Some(max) = self.max_iterations {
        if self.iterations >= max {
          warn!(
            participant = %self.local_participant,
            iterations = self.iterations,
            "iteration limit reached, forcing convergence"
          );
          all_converged = true;
        }
      }
    }
    Ok(all_converged)
  }

  /// Resets every measure's series from the current converged values.
  pub(crate) fn new_measurement_series(&mut self) {
    for context in &mut self.measures {
      if let Some(cell) = self.all_data.get(&context.data_id) {
        let old = cell.borrow().old_column();
        context.measure.new_measurement_series(&old);
      }
    }
  }

  /// Books a completed timestep: counters, history shift, extrapolation,
  /// checkpoint cadence.
  pub(crate) fn complete_timestep(&mut self, implicit: bool) {
    self.timesteps += 1;
    self.computed_timestep_part = 0.0;
    self.iterations = 1;
    self.timestep_complete = true;

    for cell in self.all_data.values() {
      let mut cell = cell.borrow_mut();
      cell.shift_columns();
      if self.is_coupling_ongoing_base() {
        cell.extrapolate(self.extrapolation_order);
      }
    }
    self.new_measurement_series();

    if implicit {
      self.require_action(Action::WriteIterationCheckpoint);
    }
    if let Some(interval) = self.checkpoint_interval {
      if interval > 0 && self.timesteps % interval == 0 {
        self.require_action(Action::WriteSimulationCheckpoint);
      }
    }
    debug!(
      participant = %self.local_participant,
      time = self.time,
      timesteps = self.timesteps,
      "timestep complete"
    );
  }

  /// Books a repeated (non-converged) iteration: the solver rewinds, so
  /// the time walks back to the timestep start.
  pub(crate) fn repeat_timestep(&mut self) {
    self.iterations += 1;
    self.total_iterations += 1;
    self.time -= self.computed_timestep_part;
    self.computed_timestep_part = 0.0;
    self.timestep_complete = false;
    self.require_action(Action::ReadIterationCheckpoint);
  }

  /// Copies the current values into `old_values` column 0 of every cell.
  pub(crate) fn update_old_values(&mut self) {
    for cell in self.all_data.values() {
      cell.borrow_mut().update_old();
    }
  }

  // ---------------------------------------------------------------------
  // State display and checkpointing
  // ---------------------------------------------------------------------

  pub(crate) fn print_state(&self, implicit: bool) -> String {
    let mut out = String::new();
    if implicit {
      out.push_str(&match self.max_iterations {
        Some(max) => format!("it {} of {max} | ", self.iterations),
        None => format!("it {} | ", self.iterations),
      });
    }
    out.push_str(&format!("dt# {}", self.timesteps));
    if let Some(max) = self.max_timesteps {
      out.push_str(&format!(" of {max}"));
    }
    out.push_str(&format!(" | t {}", self.time));
    if let Some(max) = self.max_time {
      out.push_str(&format!(" of {max}"));
    }
    match self.timestep_length {
      Some(length) => out.push_str(&format!(" | dt {length}")),
      None => out.push_str(" | dt free"),
    }
    out.push_str(&format!(" | dt part {}", self.computed_timestep_part));
    out.push_str(&format!(" | ongoing {}", if self.is_coupling_ongoing_base() { "yes" } else { "no" }));
    out.push_str(&format!(" | dt complete {}", if self.timestep_complete { "yes" } else { "no" }));
    out
  }

  pub(crate) fn export_to(&self, prefix: &str) -> Result<()> {
    let mut kv = KeyValueFile::new();
    kv.set_f64("time", self.time);
    kv.set_usize("timesteps", self.timesteps);
    kv.set_f64("computed-timestep-part", self.computed_timestep_part);
    kv.set_usize("iterations", self.iterations);
    kv.set_usize("total-iterations", self.total_iterations);
    kv.set_bool("timestep-complete", self.timestep_complete);
    for (id, cell) in &self.all_data {
      let cell = cell.borrow();
      kv.set_f64s(&format!("data-{}-values", id.0), &cell.values());
      for column in 0..cell.old_values.ncols() {
        let values: Vec<f64> = cell.old_values.column(column).iter().copied().collect();
        kv.set_f64s(&format!("data-{}-old-{column}", id.0), &values);
      }
    }
    kv.write(format!("{prefix}_cplscheme.txt"))?;
    Ok(())
  }

  pub(crate) fn import_from(&mut self, prefix: &str) -> Result<()> {
    let kv = KeyValueFile::read(format!("{prefix}_cplscheme.txt"))?;
    self.time = kv.get_f64("time")?;
    self.timesteps = kv.get_usize("timesteps")?;
    self.computed_timestep_part = kv.get_f64("computed-timestep-part")?;
    self.iterations = kv.get_usize("iterations")?;
    self.total_iterations = kv.get_usize("total-iterations")?;
    self.timestep_complete = kv.get_bool("timestep-complete")?;
    for (id, cell) in &self.all_data {
      let mut cell = cell.borrow_mut();
      if kv.contains(&format!("data-{}-values", id.0)) {
        let values = kv.get_f64s(&format!("data-{}-values", id.0))?;
        cell.set_values(&values);
      }
      let mut column = 0;
      while kv.contains(&format!("data-{}-old-{column}", id.0)) {
        let values = kv.get_f64s(&format!("data-{}-old-{column}", id.0))?;
        cell.ensure_old_columns(column + 1);
        cell.old_values.set_column(column, &nalgebra::DVector::from_vec(values));
        column += 1;
      }
    }
    self.new_measurement_series();
    Ok(())
  }

  /// Shared initial-data bookkeeping: baselines the old values of every
  /// binding that took part in the exchange.
  pub(crate) fn baseline_initialized_data(&mut self) {
    for cell in self.all_data.values() {
      let mut cell = cell.borrow_mut();
      if cell.requires_initialization {
        cell.update_old();
      }
    }
    self.new_measurement_series();
  }

  /// Lists the send cells participating in the initial exchange.
  pub(crate) fn send_init_cells(&self) -> Vec<PtrCouplingData> {
    self
      .send_data
      .values()
      .filter(|cell| cell.borrow().requires_initialization)
      .cloned()
      .collect()
  }

  pub(crate) fn receive_init_cells(&self) -> Vec<PtrCouplingData> {
    self
      .receive_data
      .values()
      .filter(|cell| cell.borrow().requires_initialization)
      .cloned()
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use std::cell::RefCell;

  use glam::DVec3;

  use super::*;
  use crate::ids::IdAllocator;
  use crate::mesh::Mesh;

  /// Base scheme over one scalar field on a single-rank participant.
  fn base_with_field(values: &[f64]) -> (BaseCouplingScheme, DataId) {
    let mut ids = IdAllocator::new();
    let mut mesh = Mesh::new("m", 2, &mut ids);
    for _ in 0..values.len() {
      mesh.create_vertex(DVec3::ZERO);
    }
    let data = mesh.create_data("field", 1, &mut ids);
    mesh.allocate_data_values();
    data.borrow_mut().set_values(values);
    let id = data.borrow().id();
    let mesh = Rc::new(RefCell::new(mesh));

    let mut base =
      BaseCouplingScheme::new("Solo", Rc::new(IntraComm::serial()), Some(0.1), None, Some(10));
    base.add_send_data(data, mesh, false);
    (base, id)
  }

  /// A scheme with several measures converges only when all of them do.
  #[test]
  fn test_convergence_is_conjunction() {
    let (mut base, id) = base_with_field(&[1.0]);
    base.add_convergence_measure(id, ConvergenceMeasure::absolute(10.0).unwrap());
    base.add_convergence_measure(id, ConvergenceMeasure::absolute(0.1).unwrap());
    base.initialize_base(0.0, 0).unwrap();

    // Difference against the zero old values is 1: inside the loose limit,
    // outside the tight one.
    assert!(!base.measure_convergence().unwrap());

    base.update_old_values();
    assert!(base.measure_convergence().unwrap(), "zero difference satisfies both");
  }

  /// Convergence is suppressed below the minimum iteration count.
  #[test]
  fn test_min_iterations_suppression() {
    let (mut base, id) = base_with_field(&[1.0]);
    base.add_convergence_measure(id, ConvergenceMeasure::absolute(10.0).unwrap());
    base.set_iteration_limits(Some(2), None);
    base.initialize_base(0.0, 0).unwrap();

    assert!(!base.measure_convergence().unwrap(), "iteration 1 of min 2");
    base.iterations = 2;
    assert!(base.measure_convergence().unwrap());
  }

  /// Reaching the iteration limit forces convergence.
  #[test]
  fn test_max_iterations_forces_convergence() {
    let (mut base, id) = base_with_field(&[1.0]);
    base.add_convergence_measure(id, ConvergenceMeasure::absolute(1e-12).unwrap());
    base.set_iteration_limits(None, Some(1));
    base.initialize_base(0.0, 0).unwrap();

    assert!(base.measure_convergence().unwrap(), "forced at the limit");
  }

  /// The checkpoint cadence raises the simulation-checkpoint action.
  #[test]
  fn test_checkpoint_interval_cadence() {
    let (mut base, _) = base_with_field(&[1.0]);
    base.set_checkpoint_interval(Some(2));
    base.initialize_base(0.0, 0).unwrap();

    base.complete_timestep(false);
    assert!(!base.is_action_required(Action::WriteSimulationCheckpoint));
    base.complete_timestep(false);
    assert!(base.is_action_required(Action::WriteSimulationCheckpoint));
  }
}
