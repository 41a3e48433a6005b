//! Communication fabric between two coupled participants.
//!
//! An [`M2N`] pairs a one-to-one *master channel* (small control messages:
//! timestep lengths, convergence flags) with one *distributed channel* per
//! registered mesh that routes per-vertex field slices between the ranks of
//! both participants.
//!
//! ```text
//!   participant A                      participant B
//!   rank 0 (master) ─── master channel ─── rank 0 (master)
//!   rank 0..n  ─┐                            ┌─ rank 0..m
//!   rank 1..n  ─┼──── distributed channel ───┼─ rank 1..m
//!               └── (gather-scatter | p2p) ──┘
//! ```
//!
//! Distributed channels for several meshes are connected in mesh-name-sorted
//! order on both sides, which keeps the two-sided blocking setups aligned.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, info};

use crate::com::{CommunicationFactory, IntraComm, PtrCommunication};
use crate::error::{CoupleError, Result};
use crate::ids::MeshId;
use crate::mesh::PtrMesh;

pub mod gather_scatter;
pub mod point_to_point;

pub use gather_scatter::GatherScatterCommunication;
pub use point_to_point::PointToPointCommunication;

/// Per-mesh distributed exchange between the ranks of two participants.
pub trait DistributedCommunication {
  fn is_connected(&self) -> bool;

  fn accept_connection(&mut self, acceptor: &str, requester: &str) -> Result<()>;

  fn request_connection(&mut self, acceptor: &str, requester: &str) -> Result<()>;

  fn close_connection(&mut self) -> Result<()>;

  /// Ships the local slice of a field; `values` holds
  /// `local_vertex_count * value_dim` doubles.
  fn send(&mut self, values: &[f64], value_dim: usize) -> Result<()>;

  /// Receives the local slice of a field into `values`.
  fn receive(&mut self, values: &mut [f64], value_dim: usize) -> Result<()>;
}

/// Chooses how distributed channels are built.
pub enum DistributedFactory {
  /// Slices travel through both masters; the participant master gathers and
  /// scatters over the intra channel.
  GatherScatter,
  /// Each overlapping rank pair holds its own channel.
  PointToPoint(Rc<dyn CommunicationFactory>),
}

impl DistributedFactory {
  fn build(
    &self,
    mesh: PtrMesh,
    intra: Rc<IntraComm>,
    master_com: PtrCommunication,
  ) -> Box<dyn DistributedCommunication> {
    match self {
      DistributedFactory::GatherScatter => {
        Box::new(GatherScatterCommunication::new(mesh, intra, master_com))
      }
      DistributedFactory::PointToPoint(factory) => Box::new(PointToPointCommunication::new(
        mesh,
        intra,
        factory.clone(),
        master_com,
      )),
    }
  }
}

struct MeshChannel {
  mesh_name: String,
  channel: Box<dyn DistributedCommunication>,
}

/// The two-channel fabric towards one remote participant.
pub struct M2N {
  master_com: PtrCommunication,
  factory: DistributedFactory,
  intra: Rc<IntraComm>,
  channels: BTreeMap<MeshId, MeshChannel>,
  master_connected: bool,
}

impl M2N {
  pub fn new(master_com: PtrCommunication, factory: DistributedFactory, intra: Rc<IntraComm>) -> Self {
    Self { master_com, factory, intra, channels: BTreeMap::new(), master_connected: false }
  }

  pub fn is_master_connected(&self) -> bool {
    self.master_connected
  }

  /// Accepts the master channel; the remote participant requests it.
  /// Slaves only record the connection.
  pub fn accept_master_connection(&mut self, local: &str, remote: &str) -> Result<()> {
    if self.master_connected {
      return Err(CoupleError::AlreadyConnected(format!("{local}<->{remote} master channel")));
    }
    if !self.intra.is_slave() {
      self.master_com.borrow_mut().accept_connection(local, remote)?;
      info!(local, remote, "master channel accepted");
    }
    self.master_connected = true;
    Ok(())
  }

  /// Requests the master channel from the accepting participant.
  pub fn request_master_connection(&mut self, remote: &str, local: &str) -> Result<()> {
    if self.master_connected {
      return Err(CoupleError::AlreadyConnected(format!("{local}<->{remote} master channel")));
    }
    if !self.intra.is_slave() {
      self.master_com.borrow_mut().request_connection(remote, local, 0, 1)?;
      info!(local, remote, "master channel requested");
    }
    self.master_connected = true;
    Ok(())
  }

  /// Registers a mesh so the following slaves connection can discover its
  /// per-rank vertex assignment.
  pub fn create_distributed_communication(&mut self, mesh: &PtrMesh) {
    let (id, name) = {
      let mesh = mesh.borrow();
      (mesh.id(), mesh.name().to_string())
    };
    let channel = self.factory.build(mesh.clone(), self.intra.clone(), self.master_com.clone());
    self.channels.insert(id, MeshChannel { mesh_name: name, channel });
  }

  /// Meshes in name-sorted order; both participants must use the same
  /// schedule for the blocking two-sided setups below.
  fn mesh_ids_name_sorted(&self) -> Vec<MeshId> {
    let mut ids: Vec<(String, MeshId)> =
      self.channels.iter().map(|(id, entry)| (entry.mesh_name.clone(), *id)).collect();
    ids.sort();
    ids.into_iter().map(|(_, id)| id).collect()
  }

  /// Connects the distributed channels of all registered meshes.
  pub fn accept_slaves_connection(&mut self, local: &str, remote: &str) -> Result<()> {
    for id in self.mesh_ids_name_sorted() {
      let entry = self.channels.get_mut(&id).expect("registered mesh");
      debug!(mesh = %entry.mesh_name, "accepting slaves connection");
      entry.channel.accept_connection(local, remote)?;
    }
    Ok(())
  }

  pub fn request_slaves_connection(&mut self, remote: &str, local: &str) -> Result<()> {
    for id in self.mesh_ids_name_sorted() {
      let entry = self.channels.get_mut(&id).expect("registered mesh");
      debug!(mesh = %entry.mesh_name, "requesting slaves connection");
      entry.channel.request_connection(remote, local)?;
    }
    Ok(())
  }

  /// Closes every channel of the fabric.
  pub fn close_connection(&mut self) -> Result<()> {
    for entry in self.channels.values_mut() {
      if entry.channel.is_connected() {
        entry.channel.close_connection()?;
      }
    }
    self.channels.clear();
    if !self.intra.is_slave() && self.master_com.borrow().is_connected() {
      self.master_com.borrow_mut().close_connection()?;
    }
    self.master_connected = false;
    Ok(())
  }

  fn channel_mut(&mut self, mesh: MeshId) -> Result<&mut Box<dyn DistributedCommunication>> {
    match self.channels.get_mut(&mesh) {
      Some(entry) => Ok(&mut entry.channel),
      None => Err(CoupleError::NotReady(format!("no distributed channel for mesh {mesh:?}"))),
    }
  }

  /// Sends the local slice of a field over the mesh's distributed channel.
  pub fn send(&mut self, values: &[f64], mesh: MeshId, value_dim: usize) -> Result<()> {
    self.channel_mut(mesh)?.send(values, value_dim)
  }

  /// Receives the local slice of a field from the mesh's distributed channel.
  pub fn receive(&mut self, values: &mut [f64], mesh: MeshId, value_dim: usize) -> Result<()> {
    self.channel_mut(mesh)?.receive(values, value_dim)
  }

  // ---------------------------------------------------------------------
  // Master-channel control messages (rank 0 only)
  // ---------------------------------------------------------------------

  fn master_com_checked(&self) -> Result<&PtrCommunication> {
    if self.intra.is_slave() || !self.master_connected {
      return Err(CoupleError::NotConnected("master channel".into()));
    }
    Ok(&self.master_com)
  }

  pub fn send_f64_master(&self, value: f64) -> Result<()> {
    self.master_com_checked()?.borrow().send_f64(value, 0)
  }

  pub fn recv_f64_master(&self) -> Result<f64> {
    self.master_com_checked()?.borrow().recv_f64(0)
  }

  pub fn send_bool_master(&self, value: bool) -> Result<()> {
    self.master_com_checked()?.borrow().send_bool(value, 0)
  }

  pub fn recv_bool_master(&self) -> Result<bool> {
    self.master_com_checked()?.borrow().recv_bool(0)
  }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
