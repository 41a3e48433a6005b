use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::thread;

use glam::DVec3;

use super::*;
use crate::com::channel::{ChannelCommunication, ChannelCommunicationFactory, ChannelNetwork};
use crate::ids::IdAllocator;
use crate::mesh::Mesh;

fn master_com(network: &ChannelNetwork) -> PtrCommunication {
  Rc::new(RefCell::new(ChannelCommunication::new(network.clone())))
}

fn mesh_with_vertices(count: usize) -> PtrMesh {
  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("Field", 2, &mut ids);
  for i in 0..count {
    mesh.create_vertex(DVec3::new(i as f64, 0.0, 0.0));
  }
  Rc::new(RefCell::new(mesh))
}

/// Gather-scatter round trip: one serial participant coupled to a
/// three-rank participant whose distribution duplicates global vertex 3.
/// Contributions of the duplicated vertex are summed on the way back.
#[test]
fn test_gather_scatter_exchange() {
  let network = ChannelNetwork::new();
  let mut handles = Vec::new();

  // Serial participant.
  {
    let network = network.clone();
    handles.push(thread::spawn(move || {
      let intra = Rc::new(IntraComm::serial());
      let mut m2n = M2N::new(master_com(&network), DistributedFactory::GatherScatter, intra);
      m2n.accept_master_connection("One", "Two").unwrap();

      let mesh = mesh_with_vertices(6);
      mesh.borrow_mut().compute_distribution(&IntraComm::serial()).unwrap();
      let mesh_id = mesh.borrow().id();
      m2n.create_distributed_communication(&mesh);
      m2n.accept_slaves_connection("One", "Two").unwrap();

      let mut values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
      m2n.send(&values, mesh_id, 1).unwrap();
      m2n.receive(&mut values, mesh_id, 1).unwrap();
      assert_eq!(values, vec![2.0, 4.0, 6.0, 16.0, 10.0, 12.0]);
      m2n.close_connection().unwrap();
    }));
  }

  // Parallel participant: master plus two slaves; the distribution holds
  // vertex 3 on both rank 0 and rank 2, and rank 1 holds nothing.
  for rank in 0..3usize {
    let network = network.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network.clone());
      let intra = Rc::new(if rank == 0 {
        IntraComm::connect_master("Two", 3, &factory).unwrap()
      } else {
        IntraComm::connect_slave("Two", rank, 3, &factory).unwrap()
      });
      let mut m2n =
        M2N::new(master_com(&network), DistributedFactory::GatherScatter, intra.clone());
      m2n.request_master_connection("One", "Two").unwrap();

      let mesh = mesh_with_vertices(0);
      if rank == 0 {
        let mut distribution = BTreeMap::new();
        distribution.insert(0usize, vec![0, 1, 3]);
        distribution.insert(2usize, vec![2, 3, 4, 5]);
        mesh.borrow_mut().set_vertex_distribution(distribution);
        mesh.borrow_mut().set_global_vertex_count(6);
      }
      let mesh_id = mesh.borrow().id();
      m2n.create_distributed_communication(&mesh);
      m2n.request_slaves_connection("One", "Two").unwrap();

      let len = match rank {
        0 => 3,
        1 => 0,
        _ => 4,
      };
      let mut values = vec![0.0; len];
      m2n.receive(&mut values, mesh_id, 1).unwrap();
      match rank {
        0 => assert_eq!(values, vec![1.0, 2.0, 4.0]),
        1 => assert!(values.is_empty()),
        _ => assert_eq!(values, vec![3.0, 4.0, 5.0, 6.0]),
      }
      for v in &mut values {
        *v *= 2.0;
      }
      m2n.send(&values, mesh_id, 1).unwrap();
      m2n.close_connection().unwrap();
    }));
  }

  for handle in handles {
    handle.join().unwrap();
  }
}

/// Point-to-point routing between two two-rank participants: owners send,
/// holders receive, and a vertex held by two receiving ranks fans out.
#[test]
fn test_point_to_point_exchange() {
  let network = ChannelNetwork::new();
  let mut handles = Vec::new();

  // Side A owns all four global vertices, split two per rank. It sends the
  // pattern value(g) = 10 * g.
  for rank in 0..2usize {
    let network = network.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network.clone());
      let intra = Rc::new(if rank == 0 {
        IntraComm::connect_master("A", 2, &factory).unwrap()
      } else {
        IntraComm::connect_slave("A", rank, 2, &factory).unwrap()
      });
      let p2p = DistributedFactory::PointToPoint(Rc::new(ChannelCommunicationFactory::new(
        network.clone(),
      )));
      let mut m2n = M2N::new(master_com(&network), p2p, intra.clone());
      m2n.accept_master_connection("A", "B").unwrap();

      let mesh = mesh_with_vertices(2);
      if rank == 0 {
        let mut distribution = BTreeMap::new();
        distribution.insert(0usize, vec![0, 1]);
        distribution.insert(1usize, vec![2, 3]);
        mesh.borrow_mut().set_vertex_distribution(distribution);
        mesh.borrow_mut().set_global_vertex_count(4);
      }
      mesh.borrow_mut().compute_distribution(&intra).unwrap();
      let mesh_id = mesh.borrow().id();
      m2n.create_distributed_communication(&mesh);
      m2n.accept_slaves_connection("A", "B").unwrap();

      let values: Vec<f64> =
        mesh.borrow().held_global_indices().iter().map(|&g| 10.0 * g as f64).collect();
      m2n.send(&values, mesh_id, 1).unwrap();
      m2n.close_connection().unwrap();
    }));
  }

  // Side B holds {0,1,2} on rank 0 and {2,3} on rank 1; vertex 2 is
  // duplicated and must arrive on both ranks.
  for rank in 0..2usize {
    let network = network.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network.clone());
      let intra = Rc::new(if rank == 0 {
        IntraComm::connect_master("B", 2, &factory).unwrap()
      } else {
        IntraComm::connect_slave("B", rank, 2, &factory).unwrap()
      });
      let p2p = DistributedFactory::PointToPoint(Rc::new(ChannelCommunicationFactory::new(
        network.clone(),
      )));
      let mut m2n = M2N::new(master_com(&network), p2p, intra.clone());
      m2n.request_master_connection("A", "B").unwrap();

      let held = if rank == 0 { vec![0usize, 1, 2] } else { vec![2usize, 3] };
      let mesh = mesh_with_vertices(held.len());
      if rank == 0 {
        let mut distribution = BTreeMap::new();
        distribution.insert(0usize, vec![0, 1, 2]);
        distribution.insert(1usize, vec![2, 3]);
        mesh.borrow_mut().set_vertex_distribution(distribution);
        mesh.borrow_mut().set_global_vertex_count(4);
      }
      mesh.borrow_mut().compute_distribution(&intra).unwrap();
      let mesh_id = mesh.borrow().id();
      m2n.create_distributed_communication(&mesh);
      m2n.request_slaves_connection("A", "B").unwrap();

      let mut values = vec![0.0; held.len()];
      m2n.receive(&mut values, mesh_id, 1).unwrap();
      if rank == 0 {
        assert_eq!(values, vec![0.0, 10.0, 20.0]);
      } else {
        assert_eq!(values, vec![20.0, 30.0]);
      }
      m2n.close_connection().unwrap();
    }));
  }

  for handle in handles {
    handle.join().unwrap();
  }
}

/// A second master connection on the same fabric is a duplicate setup, and
/// control messages flow over the master channel.
#[test]
fn test_master_channel_lifecycle() {
  let network = ChannelNetwork::new();
  let remote = network.clone();

  let peer = thread::spawn(move || {
    let intra = Rc::new(IntraComm::serial());
    let mut m2n = M2N::new(master_com(&remote), DistributedFactory::GatherScatter, intra);
    m2n.request_master_connection("Left", "Right").unwrap();
    m2n.send_f64_master(0.25).unwrap();
    assert!(m2n.recv_bool_master().unwrap());
  });

  let intra = Rc::new(IntraComm::serial());
  let mut m2n = M2N::new(master_com(&network), DistributedFactory::GatherScatter, intra);
  m2n.accept_master_connection("Left", "Right").unwrap();
  match m2n.accept_master_connection("Left", "Right") {
    Err(CoupleError::AlreadyConnected(_)) => {}
    other => panic!("expected AlreadyConnected, got {other:?}"),
  }
  assert_eq!(m2n.recv_f64_master().unwrap(), 0.25);
  m2n.send_bool_master(true).unwrap();
  peer.join().unwrap();
}

/// Sending on an unregistered mesh is NotReady.
#[test]
fn test_send_without_distributed_channel() {
  let intra = Rc::new(IntraComm::serial());
  let network = ChannelNetwork::new();
  let mut m2n = M2N::new(master_com(&network), DistributedFactory::GatherScatter, intra);
  let mesh = mesh_with_vertices(1);
  let id = mesh.borrow().id();
  match m2n.send(&[1.0], id, 1) {
    Err(CoupleError::NotReady(_)) => {}
    other => panic!("expected NotReady, got {other:?}"),
  }
}
