//! Shared helpers for coupling-scheme tests.

use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec3;

use crate::com::channel::{ChannelCommunication, ChannelNetwork};
use crate::com::{IntraComm, PtrCommunication};
use crate::cplscheme::bilateral::BilateralConfig;
use crate::cplscheme::{Arrangement, Mode};
use crate::ids::IdAllocator;
use crate::m2n::{DistributedFactory, M2N};
use crate::mesh::{Mesh, PtrData, PtrMesh};

/// Everything one serial participant needs for a bilateral scheme test.
pub struct Rig {
  pub mesh: PtrMesh,
  pub force: PtrData,
  pub displ: PtrData,
  pub m2n: Rc<RefCell<M2N>>,
  pub intra: Rc<IntraComm>,
}

/// Builds a serial participant with a two-field mesh of `vertex_count`
/// vertices and a connected gather-scatter fabric towards the peer. Uses
/// a fresh id allocator; participants talking to several peers use
/// [`rig_with_ids`] so ids stay unique across their meshes.
pub fn rig(
  network: &ChannelNetwork,
  local: &str,
  remote: &str,
  acceptor: bool,
  vertex_count: usize,
) -> Rig {
  let mut ids = IdAllocator::new();
  rig_with_ids(network, local, remote, acceptor, vertex_count, &mut ids)
}

/// [`rig`] with a caller-provided participant-wide id allocator.
pub fn rig_with_ids(
  network: &ChannelNetwork,
  local: &str,
  remote: &str,
  acceptor: bool,
  vertex_count: usize,
  ids: &mut IdAllocator,
) -> Rig {
  let mut mesh = Mesh::new(format!("grid-{local}-{remote}"), 2, ids);
  for i in 0..vertex_count {
    mesh.create_vertex(DVec3::new(i as f64, 0.0, 0.0));
  }
  let force = mesh.create_data("force", 1, ids);
  let displ = mesh.create_data("displacement", 1, ids);
  mesh.allocate_data_values();

  let intra = Rc::new(IntraComm::serial());
  mesh.compute_distribution(&intra).unwrap();
  let mesh = Rc::new(RefCell::new(mesh));

  let master: PtrCommunication = Rc::new(RefCell::new(ChannelCommunication::new(network.clone())));
  let mut m2n = M2N::new(master, DistributedFactory::GatherScatter, intra.clone());
  if acceptor {
    m2n.accept_master_connection(local, remote).unwrap();
  } else {
    m2n.request_master_connection(remote, local).unwrap();
  }
  m2n.create_distributed_communication(&mesh);
  if acceptor {
    m2n.accept_slaves_connection(local, remote).unwrap();
  } else {
    m2n.request_slaves_connection(remote, local).unwrap();
  }

  Rig { mesh, force, displ, m2n: Rc::new(RefCell::new(m2n)), intra }
}

/// Bilateral scheme configuration between `first` and `second`.
pub fn scheme_config(
  first: &str,
  second: &str,
  local: &str,
  arrangement: Arrangement,
  mode: Mode,
  timestep_length: Option<f64>,
  max_time: Option<f64>,
  max_timesteps: Option<usize>,
) -> BilateralConfig {
  BilateralConfig {
    first_participant: first.into(),
    second_participant: second.into(),
    local_participant: local.into(),
    arrangement,
    mode,
    timestep_length,
    max_time,
    max_timesteps,
  }
}
