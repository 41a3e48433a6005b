use std::cell::RefCell;
use std::rc::Rc;
use std::thread;

use approx::assert_relative_eq;

use super::*;
use crate::com::channel::{ChannelCommunication, ChannelNetwork};
use crate::com::IntraComm;
use crate::cplscheme::convergence::ConvergenceMeasure;
use crate::cplscheme::test_utils::{rig, scheme_config};
use crate::cplscheme::SimulationState;
use crate::error::CoupleError;
use crate::m2n::{DistributedFactory, M2N};

fn config(
  local: &str,
  arrangement: Arrangement,
  mode: Mode,
  timestep_length: Option<f64>,
  max_time: Option<f64>,
  max_timesteps: Option<usize>,
) -> BilateralConfig {
  scheme_config("Fluid", "Structure", local, arrangement, mode, timestep_length, max_time, max_timesteps)
}

/// Explicit two-participant handshake: a two-vertex mesh, one scalar
/// field, dt 0.1, max-time 0.3. The written pattern arrives unchanged and
/// both sides agree on the step length.
#[test]
fn test_explicit_handshake() {
  let network = ChannelNetwork::new();

  let fluid = {
    let network = network.clone();
    thread::spawn(move || {
      let rig = rig(&network, "Fluid", "Structure", true, 2);
      let mut scheme = BilateralCouplingScheme::new(
        config("Fluid", Arrangement::Serial, Mode::Explicit, Some(0.1), Some(0.3), None),
        rig.m2n.clone(),
        rig.intra.clone(),
      );
      scheme.base_mut().add_send_data(rig.force.clone(), rig.mesh.clone(), false);
      scheme.initialize(0.0, 0).unwrap();

      rig.force.borrow_mut().set_values(&[1.0, 2.0]);
      let mut steps = 0;
      while scheme.is_coupling_ongoing() {
        scheme.add_computed_time(0.1).unwrap();
        scheme.advance().unwrap();
        assert!(scheme.is_coupling_timestep_complete());
        steps += 1;
        if scheme.is_coupling_ongoing() {
          assert_relative_eq!(scheme.next_timestep_max_length(), 0.1, max_relative = 1e-9);
        }
      }
      assert_eq!(steps, 3);
      assert_eq!(scheme.timesteps(), 3);
      assert_relative_eq!(scheme.time(), 0.3, max_relative = 1e-12);
      scheme.finalize().unwrap();
    })
  };

  let structure = thread::spawn(move || {
    let rig = rig(&network, "Structure", "Fluid", false, 2);
    let mut scheme = BilateralCouplingScheme::new(
      config("Structure", Arrangement::Serial, Mode::Explicit, Some(0.1), Some(0.3), None),
      rig.m2n.clone(),
      rig.intra.clone(),
    );
    scheme.base_mut().add_receive_data(rig.force.clone(), rig.mesh.clone(), false);
    scheme.initialize(0.0, 0).unwrap();

    let mut first = true;
    while scheme.is_coupling_ongoing() {
      scheme.add_computed_time(0.1).unwrap();
      scheme.advance().unwrap();
      assert!(scheme.has_data_been_exchanged());
      if first {
        assert_eq!(rig.force.borrow().values(), &[1.0, 2.0]);
        first = false;
      }
    }
    assert_eq!(scheme.timesteps(), 3);
    scheme.finalize().unwrap();
  });

  fluid.join().unwrap();
  structure.join().unwrap();
}

/// Serial-implicit coupling with Aitken relaxation: the first iteration
/// applies the initial factor, the second the secant formula, and the
/// iteration limit forces convergence with a committed timestep.
#[test]
fn test_serial_implicit_with_aitken() {
  let network = ChannelNetwork::new();

  let fluid = {
    let network = network.clone();
    thread::spawn(move || {
      let rig = rig(&network, "Fluid", "Structure", true, 1);
      let mut scheme = BilateralCouplingScheme::new(
        config("Fluid", Arrangement::Serial, Mode::Implicit, Some(1.0), None, Some(1)),
        rig.m2n.clone(),
        rig.intra.clone(),
      );
      scheme.base_mut().add_send_data(rig.force.clone(), rig.mesh.clone(), false);
      scheme.base_mut().add_receive_data(rig.displ.clone(), rig.mesh.clone(), false);
      scheme
        .base_mut()
        .add_convergence_measure(rig.displ.borrow().id(), ConvergenceMeasure::absolute(1e-30).unwrap());
      scheme.base_mut().set_iteration_limits(None, Some(3));
      scheme.initialize(0.0, 0).unwrap();
      assert!(scheme.is_action_required(Action::WriteIterationCheckpoint));
      scheme.performed_action(Action::WriteIterationCheckpoint);

      rig.force.borrow_mut().set_values(&[2.0]);
      let received = [5.0, 6.25, 8.0];
      for (iteration, expected) in received.iter().enumerate() {
        scheme.add_computed_time(1.0).unwrap();
        scheme.advance().unwrap();
        assert_relative_eq!(rig.displ.borrow().values()[0], *expected, max_relative = 1e-12);
        if iteration < 2 {
          assert!(scheme.is_action_required(Action::ReadIterationCheckpoint));
          scheme.performed_action(Action::ReadIterationCheckpoint);
          assert!(!scheme.is_coupling_timestep_complete());
        } else {
          // Forced convergence at the iteration limit commits the step.
          assert!(scheme.is_action_required(Action::WriteIterationCheckpoint));
          assert!(scheme.is_coupling_timestep_complete());
        }
      }
      assert!(!scheme.is_coupling_ongoing());
    })
  };

  let structure = thread::spawn(move || {
    let rig = rig(&network, "Structure", "Fluid", false, 1);
    let mut scheme = BilateralCouplingScheme::new(
      config("Structure", Arrangement::Serial, Mode::Implicit, Some(1.0), None, Some(1)),
      rig.m2n.clone(),
      rig.intra.clone(),
    );
    scheme.base_mut().add_receive_data(rig.force.clone(), rig.mesh.clone(), false);
    scheme.base_mut().add_send_data(rig.displ.clone(), rig.mesh.clone(), false);
    let displ_id = rig.displ.borrow().id();
    scheme
      .base_mut()
      .add_convergence_measure(displ_id, ConvergenceMeasure::absolute(1e-30).unwrap());
    scheme.base_mut().set_iteration_limits(None, Some(3));
    let aitken = crate::acceleration::AitkenAcceleration::new(0.5, [displ_id], rig.intra.clone()).unwrap();
    scheme.base_mut().set_acceleration(Box::new(aitken));
    scheme.initialize(0.0, 0).unwrap();
    scheme.performed_action(Action::WriteIterationCheckpoint);

    // The structure solver answers 10, then 7, then 8.
    for answer in [10.0, 7.0, 8.0] {
      rig.displ.borrow_mut().set_values(&[answer]);
      scheme.add_computed_time(1.0).unwrap();
      scheme.advance().unwrap();
      assert_eq!(rig.force.borrow().values(), &[2.0]);
      if scheme.is_action_required(Action::ReadIterationCheckpoint) {
        scheme.performed_action(Action::ReadIterationCheckpoint);
      }
    }
    assert!(scheme.is_coupling_timestep_complete());
  });

  fluid.join().unwrap();
  structure.join().unwrap();
}

/// Action flags: require then perform leaves the flag cleared.
#[test]
fn test_action_flag_lifecycle() {
  let network = ChannelNetwork::new();
  let intra = Rc::new(IntraComm::serial());
  let master: crate::com::PtrCommunication =
    Rc::new(RefCell::new(ChannelCommunication::new(network)));
  let m2n = Rc::new(RefCell::new(M2N::new(master, DistributedFactory::GatherScatter, intra.clone())));
  let mut scheme = BilateralCouplingScheme::new(
    config("Fluid", Arrangement::Serial, Mode::Explicit, Some(0.1), None, Some(1)),
    m2n,
    intra,
  );
  assert!(!scheme.is_action_required(Action::WriteSimulationCheckpoint));
  scheme.require_action(Action::WriteSimulationCheckpoint);
  assert!(scheme.is_action_required(Action::WriteSimulationCheckpoint));
  scheme.performed_action(Action::WriteSimulationCheckpoint);
  assert!(!scheme.is_action_required(Action::WriteSimulationCheckpoint));
}

/// Adding more time than the timestep holds is an overshoot, as is an
/// advance before the step is consumed.
#[test]
fn test_overshoot_protection() {
  let network = ChannelNetwork::new();
  let intra = Rc::new(IntraComm::serial());
  let master: crate::com::PtrCommunication =
    Rc::new(RefCell::new(ChannelCommunication::new(network)));
  let m2n = Rc::new(RefCell::new(M2N::new(master, DistributedFactory::GatherScatter, intra.clone())));
  let mut scheme = BilateralCouplingScheme::new(
    config("Fluid", Arrangement::Serial, Mode::Explicit, Some(0.1), None, Some(10)),
    m2n,
    intra,
  );
  scheme.initialize(0.0, 0).unwrap();

  match scheme.add_computed_time(0.2) {
    Err(CoupleError::WouldOvershoot(_)) => {}
    other => panic!("expected WouldOvershoot, got {other:?}"),
  }
  scheme.add_computed_time(0.05).unwrap();
  match scheme.advance() {
    Err(CoupleError::WouldOvershoot(_)) => {}
    other => panic!("expected WouldOvershoot, got {other:?}"),
  }
  assert_relative_eq!(scheme.this_timestep_remainder(), 0.05, max_relative = 1e-12);
}

/// Initial data: the sending side must perform write-initial-data before
/// the exchange, the receiving side sees the values before any advance.
#[test]
fn test_initial_data_exchange() {
  let network = ChannelNetwork::new();

  let fluid = {
    let network = network.clone();
    thread::spawn(move || {
      let rig = rig(&network, "Fluid", "Structure", true, 2);
      let mut scheme = BilateralCouplingScheme::new(
        config("Fluid", Arrangement::Serial, Mode::Explicit, Some(0.1), None, Some(1)),
        rig.m2n.clone(),
        rig.intra.clone(),
      );
      scheme.base_mut().add_send_data(rig.force.clone(), rig.mesh.clone(), true);
      scheme.initialize(0.0, 0).unwrap();
      assert!(scheme.is_action_required(Action::WriteInitialData));

      // Forgetting the action is an error.
      match scheme.initialize_data() {
        Err(CoupleError::RequiredAction(_)) => {}
        other => panic!("expected RequiredAction, got {other:?}"),
      }

      rig.force.borrow_mut().set_values(&[3.0, 4.0]);
      scheme.performed_action(Action::WriteInitialData);
      scheme.initialize_data().unwrap();
    })
  };

  let structure = thread::spawn(move || {
    let rig = rig(&network, "Structure", "Fluid", false, 2);
    let mut scheme = BilateralCouplingScheme::new(
      config("Structure", Arrangement::Serial, Mode::Explicit, Some(0.1), None, Some(1)),
      rig.m2n.clone(),
      rig.intra.clone(),
    );
    scheme.base_mut().add_receive_data(rig.force.clone(), rig.mesh.clone(), true);
    scheme.initialize(0.0, 0).unwrap();
    scheme.initialize_data().unwrap();
    assert!(scheme.has_data_been_exchanged());
    assert_eq!(rig.force.borrow().values(), &[3.0, 4.0]);
  });

  fluid.join().unwrap();
  structure.join().unwrap();
}

/// Checkpoint round trip: running two implicit timesteps, persisting the
/// state, restoring it into a fresh pair and continuing yields the same
/// trajectory as running through.
#[test]
fn test_checkpoint_round_trip() {
  fn run(
    network: ChannelNetwork,
    dir: Option<std::path::PathBuf>,
    restart: Option<std::path::PathBuf>,
    steps: usize,
  ) -> (f64, usize, Vec<f64>) {
    let fluid = {
      let network = network.clone();
      let dir = dir.clone();
      let restart = restart.clone();
      thread::spawn(move || {
        let rig = rig(&network, "Fluid", "Structure", true, 1);
        let mut scheme = BilateralCouplingScheme::new(
          config("Fluid", Arrangement::Serial, Mode::Implicit, Some(0.1), None, Some(3)),
          rig.m2n.clone(),
          rig.intra.clone(),
        );
        scheme.base_mut().add_send_data(rig.force.clone(), rig.mesh.clone(), false);
        scheme.base_mut().add_receive_data(rig.displ.clone(), rig.mesh.clone(), false);
        scheme
          .base_mut()
          .add_convergence_measure(rig.displ.borrow().id(), ConvergenceMeasure::absolute(100.0).unwrap());
        let (mut start_time, mut start_step) = (0.0, 0);
        if let Some(restart) = &restart {
          let state = SimulationState::read(restart.join("run_simstate.txt")).unwrap();
          start_time = state.time;
          start_step = state.timesteps;
        }
        scheme.initialize(start_time, start_step).unwrap();
        if let Some(restart) = &restart {
          scheme.import_state(restart.join("run").to_str().unwrap()).unwrap();
        }
        scheme.performed_action(Action::WriteIterationCheckpoint);

        let mut trace = Vec::new();
        for _ in 0..steps {
          rig.force.borrow_mut().set_values(&[(scheme.timesteps() + 1) as f64]);
          scheme.add_computed_time(0.1).unwrap();
          scheme.advance().unwrap();
          assert!(scheme.is_coupling_timestep_complete(), "loose tolerance converges at once");
          scheme.performed_action(Action::WriteIterationCheckpoint);
          trace.push(rig.displ.borrow().values()[0]);
        }
        if let Some(dir) = &dir {
          SimulationState {
            time: scheme.time(),
            timesteps: scheme.timesteps(),
            advance_calls: steps,
          }
          .write(dir.join("run_simstate.txt"))
          .unwrap();
          scheme.export_state(dir.join("run").to_str().unwrap()).unwrap();
        }
        (scheme.time(), scheme.timesteps(), trace)
      })
    };

    let structure = thread::spawn(move || {
      let rig = rig(&network, "Structure", "Fluid", false, 1);
      let mut scheme = BilateralCouplingScheme::new(
        config("Structure", Arrangement::Serial, Mode::Implicit, Some(0.1), None, Some(3)),
        rig.m2n.clone(),
        rig.intra.clone(),
      );
      scheme.base_mut().add_receive_data(rig.force.clone(), rig.mesh.clone(), false);
      scheme.base_mut().add_send_data(rig.displ.clone(), rig.mesh.clone(), false);
      scheme
        .base_mut()
        .add_convergence_measure(rig.displ.borrow().id(), ConvergenceMeasure::absolute(100.0).unwrap());
      let (mut start_time, mut start_step) = (0.0, 0);
      if let Some(restart) = &restart {
        let state = SimulationState::read(restart.join("run_simstate.txt")).unwrap();
        start_time = state.time;
        start_step = state.timesteps;
      }
      scheme.initialize(start_time, start_step).unwrap();
      if let Some(restart) = &restart {
        scheme.import_state(restart.join("run-peer").to_str().unwrap()).unwrap();
      }
      scheme.performed_action(Action::WriteIterationCheckpoint);

      for _ in 0..steps {
        let received = rig.force.borrow().values()[0];
        rig.displ.borrow_mut().set_values(&[received * 10.0]);
        scheme.add_computed_time(0.1).unwrap();
        scheme.advance().unwrap();
        scheme.performed_action(Action::WriteIterationCheckpoint);
      }
      if let Some(dir) = &dir {
        scheme.export_state(dir.join("run-peer").to_str().unwrap()).unwrap();
      }
    });

    let result = fluid.join().unwrap();
    structure.join().unwrap();
    result
  }

  // Uninterrupted reference run over three timesteps.
  let (ref_time, ref_steps, ref_trace) = run(ChannelNetwork::new(), None, None, 3);

  // Checkpointed run: two steps, persist, restart, one more step.
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().to_path_buf();
  let (mid_time, mid_steps, mut trace) = run(ChannelNetwork::new(), Some(path.clone()), None, 2);
  assert_relative_eq!(mid_time, 0.2, max_relative = 1e-12);
  assert_eq!(mid_steps, 2);
  let (end_time, end_steps, tail) = run(ChannelNetwork::new(), None, Some(path), 1);
  trace.extend(tail);

  assert_relative_eq!(end_time, ref_time, max_relative = 1e-12);
  assert_eq!(end_steps, ref_steps);
  assert_eq!(trace, ref_trace);
}
