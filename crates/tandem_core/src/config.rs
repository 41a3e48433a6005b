//! Typed configuration of the coupling engine.
//!
//! The engine does not parse configuration files itself; an external
//! front end produces these structures. Validation happens here, once,
//! before anything is wired up, so every invalid constant fails at
//! configure time rather than mid-run.

use crate::error::{CoupleError, Result};

/// Transport behind an M2N channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
  /// In-process crossbeam channels.
  Channel,
  /// TCP sockets with filesystem rendezvous.
  Sockets,
  /// MPI ports; requires an MPI runtime and is not available here.
  MpiPorts,
  /// MPI world-splitting; requires an MPI runtime and is not available
  /// here.
  MpiDirect,
}

/// Distributed-channel flavor of an M2N channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistributionKind {
  GatherScatter,
  PointToPoint,
}

/// M2N channel between one participant pair.
#[derive(Clone, Debug)]
pub struct M2nConfig {
  pub from: String,
  pub to: String,
  pub transport: TransportKind,
  pub distribution: DistributionKind,
}

/// Configured coupling-scheme flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchemeKind {
  SerialExplicit,
  ParallelExplicit,
  SerialImplicit,
  ParallelImplicit,
  Multi,
}

impl SchemeKind {
  pub fn is_implicit(&self) -> bool {
    matches!(self, SchemeKind::SerialImplicit | SchemeKind::ParallelImplicit | SchemeKind::Multi)
  }
}

/// One exchanged field: data name, source mesh, and the sending
/// participant.
#[derive(Clone, Debug)]
pub struct ExchangeConfig {
  pub data: String,
  pub mesh: String,
  pub from: String,
  pub to: String,
  /// Ship the field once before the first advance.
  pub initialize: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConvergenceMeasureKind {
  Absolute,
  Relative,
  ResidualRelative,
  WeightedRms,
}

#[derive(Clone, Debug)]
pub struct ConvergenceMeasureConfig {
  pub kind: ConvergenceMeasureKind,
  pub data: String,
  pub limit: f64,
  /// Second tolerance of the weighted-RMS measure.
  pub abs_tolerance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelerationKind {
  ConstantRelaxation,
  Aitken,
  IqnIls,
  IqnImvj,
  ManifoldMapping,
}

#[derive(Clone, Debug)]
pub struct AccelerationConfig {
  pub kind: AccelerationKind,
  pub data: Vec<String>,
  /// Coarse-model data of the manifold-mapping variant.
  pub coarse_data: Vec<String>,
  pub initial_relaxation: f64,
  pub max_used_iterations: usize,
  pub timesteps_reused: usize,
}

impl Default for AccelerationConfig {
  fn default() -> Self {
    Self {
      kind: AccelerationKind::ConstantRelaxation,
      data: Vec::new(),
      coarse_data: Vec::new(),
      initial_relaxation: 1.0,
      max_used_iterations: 50,
      timesteps_reused: 0,
    }
  }
}

/// One coupling-scheme node of the configuration.
#[derive(Clone, Debug)]
pub struct CouplingSchemeConfig {
  pub kind: SchemeKind,
  pub participants: Vec<String>,
  pub timestep_length: Option<f64>,
  pub max_time: Option<f64>,
  pub max_timesteps: Option<usize>,
  pub min_iterations: Option<usize>,
  pub max_iterations: Option<usize>,
  pub extrapolation_order: usize,
  pub checkpoint_timestep_interval: Option<usize>,
  pub exchanges: Vec<ExchangeConfig>,
  pub measures: Vec<ConvergenceMeasureConfig>,
  pub acceleration: Option<AccelerationConfig>,
}

impl M2nConfig {
  pub fn validate(&self) -> Result<()> {
    if self.from == self.to {
      return Err(CoupleError::Config(format!(
        "m2n channel connects participant {} with itself",
        self.from
      )));
    }
    match self.transport {
      TransportKind::Channel | TransportKind::Sockets => Ok(()),
      TransportKind::MpiPorts | TransportKind::MpiDirect => Err(CoupleError::Config(
        "mpi transports require an MPI runtime and are not supported".into(),
      )),
    }
  }
}

impl CouplingSchemeConfig {
  pub fn validate(&self) -> Result<()> {
    match self.kind {
      SchemeKind::Multi => {
        if self.participants.len() < 3 {
          return Err(CoupleError::Config(
            "multi coupling needs more than two participants".into(),
          ));
        }
      }
      _ => {
        if self.participants.len() != 2 {
          return Err(CoupleError::Config(format!(
            "a bilateral coupling scheme needs exactly two participants, got {}",
            self.participants.len()
          )));
        }
      }
    }
    for pair in self.participants.windows(2) {
      if pair[0] == pair[1] {
        return Err(CoupleError::Config("scheme lists a participant twice".into()));
      }
    }
    if let Some(length) = self.timestep_length {
      if length <= 0.0 {
        return Err(CoupleError::Config(format!("timestep length must be positive, got {length}")));
      }
    }
    if self.max_time.map_or(false, |t| t <= 0.0) {
      return Err(CoupleError::Config("max-time must be positive".into()));
    }
    if self.extrapolation_order > 2 {
      return Err(CoupleError::Config(format!(
        "extrapolation order must be 0, 1 or 2, got {}",
        self.extrapolation_order
      )));
    }
    if let (Some(min), Some(max)) = (self.min_iterations, self.max_iterations) {
      if min > max {
        return Err(CoupleError::Config(format!(
          "min-iterations {min} exceeds max-iterations {max}"
        )));
      }
    }
    if self.kind.is_implicit() && self.measures.is_empty() && self.max_iterations.is_none() {
      return Err(CoupleError::Config(
        "implicit coupling needs convergence measures or an iteration limit".into(),
      ));
    }
    for exchange in &self.exchanges {
      if !self.participants.contains(&exchange.from) || !self.participants.contains(&exchange.to) {
        return Err(CoupleError::Config(format!(
          "exchange of {} references a participant outside the scheme",
          exchange.data
        )));
      }
    }
    for measure in &self.measures {
      let valid = match measure.kind {
        ConvergenceMeasureKind::Absolute => measure.limit > 0.0,
        ConvergenceMeasureKind::Relative | ConvergenceMeasureKind::ResidualRelative => {
          measure.limit > 0.0 && measure.limit <= 1.0
        }
        ConvergenceMeasureKind::WeightedRms => {
          measure.limit >= 0.0
            && measure.abs_tolerance >= 0.0
            && (measure.limit > 0.0 || measure.abs_tolerance > 0.0)
        }
      };
      if !valid {
        return Err(CoupleError::Config(format!(
          "convergence limit {} out of range for data {}",
          measure.limit, measure.data
        )));
      }
    }
    if let Some(acceleration) = &self.acceleration {
      acceleration.validate()?;
      if !self.kind.is_implicit() {
        return Err(CoupleError::Config(
          "acceleration configured on an explicit coupling scheme".into(),
        ));
      }
    }
    Ok(())
  }
}

impl AccelerationConfig {
  pub fn validate(&self) -> Result<()> {
    if self.initial_relaxation <= 0.0 || self.initial_relaxation > 1.0 {
      return Err(CoupleError::Config(format!(
        "relaxation factor has to be in (0; 1], got {}",
        self.initial_relaxation
      )));
    }
    if self.data.is_empty() {
      return Err(CoupleError::Config("acceleration without data fields".into()));
    }
    if self.kind == AccelerationKind::ManifoldMapping && self.coarse_data.is_empty() {
      return Err(CoupleError::Config("manifold mapping needs a coarse data group".into()));
    }
    if matches!(self.kind, AccelerationKind::IqnIls | AccelerationKind::IqnImvj)
      && self.max_used_iterations == 0
    {
      return Err(CoupleError::Config("quasi-Newton needs max-used-iterations >= 1".into()));
    }
    Ok(())
  }
}

/// Rejects compositions that nest or repeat scheme kinds illegally: a
/// compositional scheme may sequence bilateral schemes only, and a
/// participant pair may appear once.
pub fn validate_composition(children: &[CouplingSchemeConfig]) -> Result<()> {
  let mut pairs: Vec<(String, String)> = Vec::new();
  for child in children {
    child.validate()?;
    if child.kind == SchemeKind::Multi {
      return Err(CoupleError::Config(
        "multi coupling cannot be part of a compositional scheme".into(),
      ));
    }
    let mut pair = (child.participants[0].clone(), child.participants[1].clone());
    if pair.1 < pair.0 {
      std::mem::swap(&mut pair.0, &mut pair.1);
    }
    if pairs.contains(&pair) {
      return Err(CoupleError::Config(format!(
        "participants {} and {} are coupled by two schemes",
        pair.0, pair.1
      )));
    }
    pairs.push(pair);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scheme(kind: SchemeKind, participants: &[&str]) -> CouplingSchemeConfig {
    CouplingSchemeConfig {
      kind,
      participants: participants.iter().map(|p| p.to_string()).collect(),
      timestep_length: Some(0.1),
      max_time: Some(1.0),
      max_timesteps: None,
      min_iterations: None,
      max_iterations: Some(20),
      extrapolation_order: 0,
      checkpoint_timestep_interval: None,
      exchanges: Vec::new(),
      measures: Vec::new(),
      acceleration: None,
    }
  }

  #[test]
  fn test_valid_bilateral_scheme() {
    scheme(SchemeKind::SerialImplicit, &["A", "B"]).validate().unwrap();
  }

  #[test]
  fn test_multi_needs_three_participants() {
    let config = scheme(SchemeKind::Multi, &["A", "B"]);
    assert!(matches!(config.validate(), Err(CoupleError::Config(_))));
  }

  #[test]
  fn test_relaxation_range_is_checked() {
    let mut acceleration = AccelerationConfig::default();
    acceleration.data.push("forces".into());
    acceleration.initial_relaxation = 1.5;
    assert!(matches!(acceleration.validate(), Err(CoupleError::Config(_))));
    acceleration.initial_relaxation = 0.5;
    acceleration.validate().unwrap();
  }

  #[test]
  fn test_mpi_transport_rejected() {
    let m2n = M2nConfig {
      from: "A".into(),
      to: "B".into(),
      transport: TransportKind::MpiPorts,
      distribution: DistributionKind::PointToPoint,
    };
    assert!(matches!(m2n.validate(), Err(CoupleError::Config(_))));
  }

  #[test]
  fn test_composition_rejects_duplicate_pairs() {
    let children =
      vec![scheme(SchemeKind::SerialExplicit, &["A", "B"]), scheme(SchemeKind::SerialImplicit, &["B", "A"])];
    assert!(matches!(validate_composition(&children), Err(CoupleError::Config(_))));
  }

  #[test]
  fn test_composition_rejects_nested_multi() {
    let children = vec![scheme(SchemeKind::Multi, &["A", "B", "C"])];
    assert!(matches!(validate_composition(&children), Err(CoupleError::Config(_))));
  }
}
