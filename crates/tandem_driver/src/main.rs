//! Demo driver: two in-process participants coupled through the engine.
//!
//! Runs a one-dimensional heat-exchange toy problem. The `Left` solver
//! computes `u = gain_l * v + 1` from the received field `v`, the `Right`
//! solver computes `v = gain_r * u` from the received `u`; under implicit
//! coupling the pair iterates each timestep to the joint fixed point.
//!
//! ```text
//! tandem [scenario.toml] [--steps-override N]
//! ```

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::thread;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tandem_core::acceleration::{AitkenAcceleration, ConstantRelaxation, IqnIlsAcceleration};
use tandem_core::cplscheme::bilateral::BilateralConfig;
use tandem_core::{
  Action, Arrangement, BilateralCouplingScheme, ChannelCommunication, ChannelNetwork,
  ConvergenceMeasure, CouplingScheme, DistributedFactory, IdAllocator, IntraComm, Mesh, Mode,
  QuasiNewtonSettings, M2N,
};

#[derive(Parser)]
#[command(name = "tandem", about = "coupled two-solver demo")]
struct Cli {
  /// Scenario description; built-in defaults when omitted.
  scenario: Option<PathBuf>,
  /// Override the maximum number of timesteps.
  #[arg(long)]
  steps_override: Option<usize>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct Scenario {
  #[serde(default = "defaults::timestep_length")]
  timestep_length: f64,
  #[serde(default = "defaults::max_timesteps")]
  max_timesteps: usize,
  #[serde(default = "defaults::implicit")]
  implicit: bool,
  /// "constant", "aitken", "iqn-ils" or "none".
  #[serde(default = "defaults::acceleration")]
  acceleration: String,
  #[serde(default = "defaults::initial_relaxation")]
  initial_relaxation: f64,
  #[serde(default = "defaults::tolerance")]
  tolerance: f64,
  #[serde(default = "defaults::max_iterations")]
  max_iterations: usize,
  #[serde(default = "defaults::vertices")]
  vertices: usize,
  #[serde(default = "defaults::left_gain")]
  left_gain: f64,
  #[serde(default = "defaults::right_gain")]
  right_gain: f64,
}

mod defaults {
  pub fn timestep_length() -> f64 {
    0.1
  }
  pub fn max_timesteps() -> usize {
    5
  }
  pub fn implicit() -> bool {
    true
  }
  pub fn acceleration() -> String {
    "aitken".into()
  }
  pub fn initial_relaxation() -> f64 {
    0.5
  }
  pub fn tolerance() -> f64 {
    1e-10
  }
  pub fn max_iterations() -> usize {
    100
  }
  pub fn vertices() -> usize {
    8
  }
  pub fn left_gain() -> f64 {
    0.4
  }
  pub fn right_gain() -> f64 {
    0.7
  }
}

impl Default for Scenario {
  fn default() -> Self {
    toml::from_str("").expect("defaults are complete")
  }
}

fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  let mut scenario = match &cli.scenario {
    Some(path) => {
      let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
      toml::from_str(&text).with_context(|| format!("parsing scenario {}", path.display()))?
    }
    None => Scenario::default(),
  };
  if let Some(steps) = cli.steps_override {
    scenario.max_timesteps = steps;
  }
  if scenario.initial_relaxation <= 0.0 || scenario.initial_relaxation > 1.0 {
    bail!("initial-relaxation must be in (0; 1]");
  }

  let network = ChannelNetwork::new();
  let left = {
    let network = network.clone();
    let scenario = scenario.clone();
    thread::spawn(move || participant(network, scenario, Side::Left))
  };
  let right = {
    let scenario = scenario.clone();
    thread::spawn(move || participant(network, scenario, Side::Right))
  };

  let left_iterations = left.join().expect("left participant panicked")?;
  let right_iterations = right.join().expect("right participant panicked")?;
  info!(left_iterations, right_iterations, "coupled run finished");
  Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
  Left,
  Right,
}

/// Runs one coupled participant to completion; returns the total number
/// of advance calls.
fn participant(network: ChannelNetwork, scenario: Scenario, side: Side) -> anyhow::Result<usize> {
  let (local, remote) = match side {
    Side::Left => ("Left", "Right"),
    Side::Right => ("Right", "Left"),
  };

  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("interface", 2, &mut ids);
  for i in 0..scenario.vertices {
    mesh.create_vertex(glam_vertex(i));
  }
  let u = mesh.create_data("u", 1, &mut ids);
  let v = mesh.create_data("v", 1, &mut ids);
  mesh.allocate_data_values();
  let intra = Rc::new(IntraComm::serial());
  mesh.compute_distribution(&intra)?;
  let mesh = Rc::new(RefCell::new(mesh));

  let master: tandem_core::PtrCommunication =
    Rc::new(RefCell::new(ChannelCommunication::new(network.clone())));
  let mut m2n = M2N::new(master, DistributedFactory::GatherScatter, intra.clone());
  match side {
    Side::Left => m2n.accept_master_connection(local, remote)?,
    Side::Right => m2n.request_master_connection(remote, local)?,
  }
  m2n.create_distributed_communication(&mesh);
  match side {
    Side::Left => m2n.accept_slaves_connection(local, remote)?,
    Side::Right => m2n.request_slaves_connection(remote, local)?,
  }

  let mode = if scenario.implicit { Mode::Implicit } else { Mode::Explicit };
  let m2n = Rc::new(RefCell::new(m2n));
  let mut scheme = BilateralCouplingScheme::new(
    BilateralConfig {
      first_participant: "Left".into(),
      second_participant: "Right".into(),
      local_participant: local.into(),
      arrangement: Arrangement::Serial,
      mode,
      timestep_length: Some(scenario.timestep_length),
      max_time: None,
      max_timesteps: Some(scenario.max_timesteps),
    },
    m2n.clone(),
    intra.clone(),
  );

  match side {
    Side::Left => {
      scheme.base_mut().add_send_data(u.clone(), mesh.clone(), false);
      scheme.base_mut().add_receive_data(v.clone(), mesh.clone(), false);
    }
    Side::Right => {
      scheme.base_mut().add_receive_data(u.clone(), mesh.clone(), false);
      scheme.base_mut().add_send_data(v.clone(), mesh.clone(), false);
    }
  }

  if scenario.implicit {
    let v_id = v.borrow().id();
    scheme
      .base_mut()
      .add_convergence_measure(v_id, ConvergenceMeasure::absolute(scenario.tolerance)?);
    // Two iterations minimum: the first one only propagates the start
    // values, so an unchanged field must not count as converged.
    scheme.base_mut().set_iteration_limits(Some(2), Some(scenario.max_iterations));
    if side == Side::Right {
      match scenario.acceleration.as_str() {
        "constant" => {
          let relaxation = ConstantRelaxation::new(scenario.initial_relaxation, [v_id])?;
          scheme.base_mut().set_acceleration(Box::new(relaxation));
        }
        "aitken" => {
          let aitken =
            AitkenAcceleration::new(scenario.initial_relaxation, [v_id], intra.clone())?;
          scheme.base_mut().set_acceleration(Box::new(aitken));
        }
        "iqn-ils" => {
          let settings = QuasiNewtonSettings {
            initial_relaxation: scenario.initial_relaxation,
            max_used_iterations: 20,
            timesteps_reused: 1,
            data_ids: vec![v_id],
          };
          let ils = IqnIlsAcceleration::new(settings, intra.clone())?;
          scheme.base_mut().set_acceleration(Box::new(ils));
        }
        "none" => {}
        other => bail!("unknown acceleration kind `{other}`"),
      }
    }
  }

  scheme.initialize(0.0, 0)?;
  if scheme.is_action_required(Action::WriteIterationCheckpoint) {
    scheme.performed_action(Action::WriteIterationCheckpoint);
  }

  let mut advances = 0;
  while scheme.is_coupling_ongoing() {
    // Solver step: respond to the latest received field.
    match side {
      Side::Left => {
        let response: Vec<f64> =
          v.borrow().values().iter().map(|x| scenario.left_gain * x + 1.0).collect();
        u.borrow_mut().set_values(&response);
      }
      Side::Right => {
        let response: Vec<f64> =
          u.borrow().values().iter().map(|x| scenario.right_gain * x).collect();
        v.borrow_mut().set_values(&response);
      }
    }

    scheme.add_computed_time(scenario.timestep_length)?;
    scheme.advance()?;
    advances += 1;
    info!(participant = local, state = %scheme.print_coupling_state(), "advanced");

    if scheme.is_action_required(Action::ReadIterationCheckpoint) {
      scheme.performed_action(Action::ReadIterationCheckpoint);
    }
    if scheme.is_action_required(Action::WriteIterationCheckpoint) {
      scheme.performed_action(Action::WriteIterationCheckpoint);
    }
    if scheme.is_coupling_timestep_complete() {
      info!(
        participant = local,
        u = u.borrow().values().first().copied().unwrap_or(0.0),
        v = v.borrow().values().first().copied().unwrap_or(0.0),
        "timestep complete"
      );
    }
  }
  scheme.finalize()?;
  m2n.borrow_mut().close_connection()?;
  Ok(advances)
}

fn glam_vertex(i: usize) -> glam::DVec3 {
  glam::DVec3::new(i as f64, 0.0, 0.0)
}
