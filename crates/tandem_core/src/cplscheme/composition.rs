//! Sequencing of several coupling schemes for more than two participants.
//!
//! The composition keeps its children in configuration order and maintains
//! an active window `[active_begin, active_end)`. The window always starts
//! at the first scheme that has not finished the current timestep and
//! extends through the following contiguous implicit group, stopping at
//! the first explicit scheme after an implicit one. Implicit children that
//! converge before their siblings are put *on hold* (skipped, but kept in
//! the window) until the whole group converged.
//!
//! Implicitness is observed, not declared: a scheme that requires one of
//! the iteration-checkpoint actions is iterating.

use tracing::{debug, trace};

use crate::cplscheme::{Action, CouplingScheme};
use crate::error::Result;

struct Child {
  scheme: Box<dyn CouplingScheme>,
  on_hold: bool,
}

/// Ordered collection of coupling schemes acting as one.
pub struct CompositionalCouplingScheme {
  schemes: Vec<Child>,
  active_begin: usize,
  active_end: usize,
  /// Time already forwarded to active schemes but not yet to schemes that
  /// become active within the same advance.
  last_added_time: f64,
}

impl Default for CompositionalCouplingScheme {
  fn default() -> Self {
    Self::new()
  }
}

impl CompositionalCouplingScheme {
  pub fn new() -> Self {
    Self { schemes: Vec::new(), active_begin: 0, active_end: 0, last_added_time: 0.0 }
  }

  /// Appends a child scheme; composition order is execution order.
  pub fn add_coupling_scheme(&mut self, scheme: Box<dyn CouplingScheme>) {
    self.schemes.push(Child { scheme, on_hold: false });
    // Sentinel: an empty window at the back marks "not yet determined".
    self.active_begin = self.schemes.len();
    self.active_end = self.schemes.len();
  }

  fn active(&self) -> impl Iterator<Item = &Child> {
    self.schemes[self.active_begin..self.active_end].iter()
  }

  /// Forwards time to all active, not on-hold schemes without touching the
  /// composition's own accumulator.
  fn add_time_to_active(&mut self, dt: f64) -> Result<()> {
    for child in &mut self.schemes[self.active_begin..self.active_end] {
      if !child.on_hold {
        child.scheme.add_computed_time(dt)?;
      }
    }
    Ok(())
  }

  /// Recomputes the active window after an advance pass. Returns true when
  /// new schemes became active that still need handling in this advance.
  fn determine_active_coupling_schemes(&mut self) -> bool {
    let mut new_active_schemes = false;
    if self.active_begin == self.active_end {
      // First call after initialization of all children.
      debug!("determining initial active window");
      self.active_begin = 0;
      self.active_end = 0;
      self.advance_active_coupling_schemes();
      return true;
    }

    // Drop leading schemes that finished their step without iterating.
    while self.active_begin != self.active_end {
      let scheme = &self.schemes[self.active_begin].scheme;
      let explicit = !scheme.is_action_required(Action::WriteIterationCheckpoint)
        && !scheme.is_action_required(Action::ReadIterationCheckpoint);
      if explicit {
        trace!(index = self.active_begin, "removing completed explicit scheme from window");
        self.active_begin += 1;
      } else {
        break;
      }
    }

    // Check the remaining (implicit) group for convergence; converged or
    // finished members go on hold until the whole group is through.
    let mut converged = true;
    for index in self.active_begin..self.active_end {
      let child = &mut self.schemes[index];
      if child.scheme.is_action_required(Action::ReadIterationCheckpoint) {
        converged = false;
        trace!(index, "implicit scheme keeps iterating");
      } else if child.scheme.is_action_required(Action::WriteIterationCheckpoint)
        || !child.scheme.is_coupling_ongoing()
      {
        child.on_hold = true;
        trace!(index, "implicit scheme on hold");
      }
    }
    if converged {
      debug!("active implicit group converged");
      for child in &mut self.schemes[self.active_begin..self.active_end] {
        child.on_hold = false;
      }
      self.active_begin = self.active_end;
    }

    if self.active_begin == self.active_end {
      if self.active_begin == self.schemes.len() {
        // Through with all schemes: the composed timestep is complete and
        // the window wraps around for the next one.
        debug!("all schemes handled, wrapping window");
        self.active_begin = 0;
        self.active_end = 0;
        self.advance_active_coupling_schemes();
      } else {
        debug!("activating next scheme group");
        self.advance_active_coupling_schemes();
        new_active_schemes = true;
      }
    }
    new_active_schemes
  }

  /// Extends the window forward, stopping at the first explicit scheme
  /// after an implicit one.
  fn advance_active_coupling_schemes(&mut self) {
    let mut iterating = false;
    while self.active_end < self.schemes.len() {
      let scheme = &self.schemes[self.active_end].scheme;
      if scheme.is_action_required(Action::WriteIterationCheckpoint) {
        iterating = true;
      }
      if iterating && !scheme.is_action_required(Action::WriteIterationCheckpoint) {
        break;
      }
      self.active_end += 1;
    }
    assert!(self.active_begin != self.active_end, "active window may not be empty");
  }
}

impl CouplingScheme for CompositionalCouplingScheme {
  fn initialize(&mut self, start_time: f64, start_timestep: usize) -> Result<()> {
    for child in &mut self.schemes {
      child.scheme.initialize(start_time, start_timestep)?;
    }
    self.active_begin = self.schemes.len();
    self.active_end = self.schemes.len();
    self.determine_active_coupling_schemes();
    Ok(())
  }

  fn is_initialized(&self) -> bool {
    !self.schemes.is_empty() && self.schemes.iter().all(|c| c.scheme.is_initialized())
  }

  fn initialize_data(&mut self) -> Result<()> {
    for child in &mut self.schemes {
      child.scheme.initialize_data()?;
    }
    Ok(())
  }

  fn add_computed_time(&mut self, dt: f64) -> Result<()> {
    self.add_time_to_active(dt)?;
    self.last_added_time += dt;
    Ok(())
  }

  fn advance(&mut self) -> Result<()> {
    loop {
      for child in &mut self.schemes[self.active_begin..self.active_end] {
        if !child.on_hold {
          child.scheme.advance()?;
        }
      }
      if !self.determine_active_coupling_schemes() {
        break;
      }
      // Schemes activated within this advance still need the time that the
      // solver reported before they joined the window.
      let dt = self.last_added_time;
      if dt > 0.0 {
        self.add_time_to_active(dt)?;
      }
    }
    self.last_added_time = 0.0;
    Ok(())
  }

  fn finalize(&mut self) -> Result<()> {
    for child in &mut self.schemes {
      child.scheme.finalize()?;
    }
    Ok(())
  }

  fn coupling_partners(&self) -> Vec<String> {
    self.schemes.iter().flat_map(|c| c.scheme.coupling_partners()).collect()
  }

  /// Minimum over all schemes not on hold.
  fn time(&self) -> f64 {
    self
      .schemes
      .iter()
      .filter(|c| !c.on_hold)
      .map(|c| c.scheme.time())
      .fold(f64::MAX, f64::min)
  }

  fn timesteps(&self) -> usize {
    self
      .schemes
      .iter()
      .filter(|c| !c.on_hold)
      .map(|c| c.scheme.timesteps())
      .min()
      .unwrap_or(0)
  }

  fn max_time(&self) -> Option<f64> {
    self.schemes.iter().filter_map(|c| c.scheme.max_time()).fold(None, |acc, t| {
      Some(acc.map_or(t, |a: f64| a.max(t)))
    })
  }

  fn max_timesteps(&self) -> Option<usize> {
    self
      .schemes
      .iter()
      .filter_map(|c| c.scheme.max_timesteps())
      .fold(None, |acc, n| Some(acc.map_or(n, |a: usize| a.max(n))))
  }

  fn has_timestep_length(&self) -> bool {
    self.schemes.iter().any(|c| c.scheme.has_timestep_length())
  }

  /// Minimum over all schemes.
  fn timestep_length(&self) -> Option<f64> {
    self
      .schemes
      .iter()
      .filter_map(|c| c.scheme.timestep_length())
      .fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
  }

  /// Maximum over all schemes not on hold.
  fn this_timestep_remainder(&self) -> f64 {
    self
      .schemes
      .iter()
      .filter(|c| !c.on_hold)
      .map(|c| c.scheme.this_timestep_remainder())
      .fold(0.0, f64::max)
  }

  fn computed_timestep_part(&self) -> f64 {
    self
      .schemes
      .iter()
      .filter(|c| !c.on_hold)
      .map(|c| c.scheme.computed_timestep_part())
      .fold(f64::MAX, f64::min)
  }

  fn next_timestep_max_length(&self) -> f64 {
    self
      .schemes
      .iter()
      .filter(|c| !c.on_hold)
      .map(|c| c.scheme.next_timestep_max_length())
      .fold(f64::MAX, f64::min)
  }

  /// Any child still ongoing keeps the composition ongoing.
  fn is_coupling_ongoing(&self) -> bool {
    self.schemes.iter().any(|c| c.scheme.is_coupling_ongoing())
  }

  /// Complete only when every child completed its timestep.
  fn is_coupling_timestep_complete(&self) -> bool {
    self.schemes.iter().all(|c| c.scheme.is_coupling_timestep_complete())
  }

  fn has_data_been_exchanged(&self) -> bool {
    self.active().filter(|c| !c.on_hold).any(|c| c.scheme.has_data_been_exchanged())
  }

  fn will_data_be_exchanged(&self, last_solver_dt: f64) -> bool {
    self
      .active()
      .filter(|c| !c.on_hold)
      .any(|c| c.scheme.will_data_be_exchanged(last_solver_dt))
  }

  fn is_action_required(&self, action: Action) -> bool {
    self.schemes.iter().filter(|c| !c.on_hold).any(|c| c.scheme.is_action_required(action))
  }

  fn performed_action(&mut self, action: Action) {
    for child in &mut self.schemes {
      if !child.on_hold {
        child.scheme.performed_action(action);
      }
    }
  }

  fn require_action(&mut self, action: Action) {
    for child in &mut self.schemes {
      child.scheme.require_action(action);
    }
  }

  fn checkpoint_timestep_interval(&self) -> Option<usize> {
    self
      .schemes
      .iter()
      .filter_map(|c| c.scheme.checkpoint_timestep_interval())
      .fold(None, |acc, n| Some(acc.map_or(n, |a: usize| a.min(n))))
  }

  /// One line per child, prefixed with the partner name.
  fn print_coupling_state(&self) -> String {
    let mut out = String::new();
    for child in &self.schemes {
      if !out.is_empty() {
        out.push('\n');
      }
      let partners = child.scheme.coupling_partners();
      out.push_str(partners.first().map(String::as_str).unwrap_or("?"));
      out.push_str(": ");
      out.push_str(&child.scheme.print_coupling_state());
    }
    out
  }

  fn export_state(&self, prefix: &str) -> Result<()> {
    for (index, child) in self.schemes.iter().enumerate() {
      child.scheme.export_state(&format!("{prefix}_{index}"))?;
    }
    Ok(())
  }

  fn import_state(&mut self, prefix: &str) -> Result<()> {
    for (index, child) in self.schemes.iter_mut().enumerate() {
      child.scheme.import_state(&format!("{prefix}_{index}"))?;
    }
    Ok(())
  }
}

#[cfg(test)]
#[path = "composition_test.rs"]
mod composition_test;
