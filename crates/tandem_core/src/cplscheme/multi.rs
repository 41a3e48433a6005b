//! Coupling of more than two participants through one controller.
//!
//! The controller receives from every partner, evaluates convergence and
//! acceleration over the union of all coupled data, and distributes the
//! verdict plus the updated fields. All partner traffic is ordered by
//! partner name so both sides walk the same schedule. Multi coupling is
//! always implicit.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::com::IntraComm;
use crate::cplscheme::base::BaseCouplingScheme;
use crate::cplscheme::data::PtrCouplingData;
use crate::cplscheme::{Action, CouplingScheme};
use crate::error::{CoupleError, Result};
use crate::ids::DataId;
use crate::m2n::M2N;
use crate::mesh::{PtrData, PtrMesh};

/// Construction parameters of a multi scheme.
pub struct MultiConfig {
  pub controller: String,
  pub local_participant: String,
  pub timestep_length: Option<f64>,
  pub max_time: Option<f64>,
  pub max_timesteps: Option<usize>,
}

struct Partner {
  name: String,
  m2n: Rc<RefCell<M2N>>,
  send_ids: Vec<DataId>,
  receive_ids: Vec<DataId>,
}

/// N-participant implicit scheme; degenerates to the first-participant
/// role on non-controller participants (which couple to the controller
/// only).
pub struct MultiCouplingScheme {
  base: BaseCouplingScheme,
  controller: String,
  partners: Vec<Partner>,
}

impl MultiCouplingScheme {
  pub fn new(config: MultiConfig, intra: Rc<IntraComm>) -> Self {
    let base = BaseCouplingScheme::new(
      config.local_participant,
      intra,
      config.timestep_length,
      config.max_time,
      config.max_timesteps,
    );
    Self { base, controller: config.controller, partners: Vec::new() }
  }

  pub fn is_controller(&self) -> bool {
    self.base.local_participant == self.controller
  }

  pub fn base_mut(&mut self) -> &mut BaseCouplingScheme {
    &mut self.base
  }

  /// Registers the fabric towards one partner; a non-controller registers
  /// exactly the controller.
  pub fn add_partner(&mut self, name: impl Into<String>, m2n: Rc<RefCell<M2N>>) {
    let name = name.into();
    self.partners.push(Partner { name, m2n, send_ids: Vec::new(), receive_ids: Vec::new() });
    self.partners.sort_by(|a, b| a.name.cmp(&b.name));
  }

  pub fn add_send_data(
    &mut self,
    partner: &str,
    data: PtrData,
    mesh: PtrMesh,
    initialize: bool,
  ) {
    let id = data.borrow().id();
    self.base.add_send_data(data, mesh, initialize);
    let entry = self.partner_mut(partner);
    entry.send_ids.push(id);
  }

  pub fn add_receive_data(
    &mut self,
    partner: &str,
    data: PtrData,
    mesh: PtrMesh,
    initialize: bool,
  ) {
    let id = data.borrow().id();
    self.base.add_receive_data(data, mesh, initialize);
    let entry = self.partner_mut(partner);
    entry.receive_ids.push(id);
  }

  fn partner_mut(&mut self, name: &str) -> &mut Partner {
    self
      .partners
      .iter_mut()
      .find(|p| p.name == name)
      .expect("data bound to unregistered partner")
  }

  fn cells(&self, map: &BTreeMap<DataId, PtrCouplingData>, ids: &[DataId]) -> Vec<PtrCouplingData> {
    ids.iter().map(|id| map[id].clone()).collect()
  }

  fn send_to(&self, partner: &Partner, cells: &[PtrCouplingData]) -> Result<()> {
    let mut m2n = partner.m2n.borrow_mut();
    for cell in cells {
      let cell = cell.borrow();
      let mesh_id = cell.mesh.borrow().id();
      m2n.send(&cell.values(), mesh_id, cell.dimensions())?;
    }
    Ok(())
  }

  fn receive_from(&mut self, index: usize, cells: &[PtrCouplingData]) -> Result<()> {
    let mut m2n = self.partners[index].m2n.borrow_mut();
    for cell in cells {
      let cell = cell.borrow();
      let mesh_id = cell.mesh.borrow().id();
      let mut values = vec![0.0; cell.len()];
      m2n.receive(&mut values, mesh_id, cell.dimensions())?;
      cell.set_values(&values);
    }
    drop(m2n);
    if !cells.is_empty() {
      self.base.data_exchanged = true;
    }
    Ok(())
  }

  fn broadcast_convergence(&self, converged: bool) -> Result<()> {
    if !self.base.intra.is_slave() {
      for partner in &self.partners {
        partner.m2n.borrow().send_bool_master(converged)?;
      }
    }
    Ok(())
  }

  fn receive_convergence(&self) -> Result<bool> {
    let intra = &self.base.intra;
    let mut converged = false;
    if !intra.is_slave() {
      converged = self.partners[0].m2n.borrow().recv_bool_master()?;
    }
    intra.broadcast_bool(&mut converged)?;
    Ok(converged)
  }
}

impl CouplingScheme for MultiCouplingScheme {
  fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
    if self.is_controller() && self.base.measures.is_empty() {
      return Err(CoupleError::Config(
        "multi coupling needs at least one convergence measure on the controller".into(),
      ));
    }
    if !self.is_controller() && self.partners.len() != 1 {
      return Err(CoupleError::Config(
        "a non-controlling participant couples to the controller only".into(),
      ));
    }
    self.base.initialize_base(start_time, start_timestep)?;
    self.base.require_action(Action::WriteIterationCheckpoint);
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
    // Non-controllers send first; the controller answers in partner order.
    for index in 0..self.partners.len() {
      let send_init: Vec<PtrCouplingData> = self
        .cells(&self.base.send_data, &self.partners[index].send_ids)
        .into_iter()
        .filter(|cell| cell.borrow().requires_initialization)
        .collect();
      let receive_init: Vec<PtrCouplingData> = self
        .cells(&self.base.receive_data, &self.partners[index].receive_ids)
        .into_iter()
        .filter(|cell| cell.borrow().requires_initialization)
        .collect();
      if self.is_controller() {
        self.receive_from(index, &receive_init)?;
        self.send_to(&self.partners[index], &send_init)?;
      } else {
        self.send_to(&self.partners[index], &send_init)?;
        self.receive_from(index, &receive_init)?;
      }
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

    if self.is_controller() {
      for index in 0..self.partners.len() {
        let cells = self.cells(&self.base.receive_data, &self.partners[index].receive_ids);
        self.receive_from(index, &cells)?;
      }
      let converged = self.base.measure_convergence()?;
      if converged {
        if let Some(acceleration) = self.base.acceleration.as_mut() {
          acceleration.iterations_converged(&self.base.all_data)?;
        }
      } else if let Some(acceleration) = self.base.acceleration.as_mut() {
        acceleration.perform(&self.base.all_data)?;
      }
      self.broadcast_convergence(converged)?;
      for partner in &self.partners {
        let cells = self.cells(&self.base.send_data, &partner.send_ids);
        self.send_to(partner, &cells)?;
      }
      if converged {
        self.base.complete_timestep(true);
      } else {
        self.base.update_old_values();
        self.base.repeat_timestep();
      }
    } else {
      let send_cells = self.cells(&self.base.send_data, &self.partners[0].send_ids);
      self.send_to(&self.partners[0], &send_cells)?;
      let converged = self.receive_convergence()?;
      let receive_cells = self.cells(&self.base.receive_data, &self.partners[0].receive_ids);
      self.receive_from(0, &receive_cells)?;
      if converged {
        self.base.complete_timestep(true);
      } else {
        self.base.repeat_timestep();
      }
    }
    Ok(())
  }

  fn finalize(&mut self) -> Result<()> {
    self.base.check_initialized()?;
    debug!(participant = %self.base.local_participant, "multi coupling finalized");
    Ok(())
  }

  fn coupling_partners(&self) -> Vec<String> {
    self.partners.iter().map(|p| p.name.clone()).collect()
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
    self.base.print_state(true)
  }

  fn export_state(&self, prefix: &str) -> Result<()> {
    self.base.export_to(prefix)
  }

  fn import_state(&mut self, prefix: &str) -> Result<()> {
    self.base.import_from(prefix)
  }
}

#[cfg(test)]
#[path = "multi_test.rs"]
mod multi_test;
