use std::collections::BTreeMap;
use std::thread;

use glam::DVec3;

use super::*;
use crate::com::channel::{ChannelCommunicationFactory, ChannelNetwork};
use crate::com::IntraComm;
use crate::ids::IdAllocator;

/// Serial participants own their full mesh with identity global indices.
#[test]
fn test_serial_distribution() {
  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("solo", 2, &mut ids);
  for i in 0..4 {
    mesh.create_vertex(DVec3::new(i as f64, 0.0, 0.0));
  }
  mesh.compute_distribution(&IntraComm::serial()).unwrap();

  assert_eq!(mesh.global_vertex_count(), Some(4));
  assert_eq!(mesh.vertex_offsets(), &[4]);
  assert_eq!(mesh.held_global_indices(), vec![0, 1, 2, 3]);
  assert!(mesh.owner_flags().into_iter().all(|owned| owned));
}

/// Three ranks share six global vertices, one duplicated and one rank
/// empty. Offsets are prefix sums of held counts; ownership is unique:
/// rank 0 claims {0, 1}, rank 2 claims {2, 3, 4, 5}.
#[test]
fn test_three_rank_distribution_with_halo() {
  let distribution: BTreeMap<usize, Vec<usize>> =
    [(0usize, vec![0, 1, 3]), (1, vec![]), (2, vec![2, 3, 4, 5])].into_iter().collect();
  let network = ChannelNetwork::new();

  let mut handles = Vec::new();
  for rank in 0..3usize {
    let network = network.clone();
    let distribution = distribution.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network);
      let intra = if rank == 0 {
        IntraComm::connect_master("fluid", 3, &factory).unwrap()
      } else {
        IntraComm::connect_slave("fluid", rank, 3, &factory).unwrap()
      };

      let mut ids = IdAllocator::new();
      let mut mesh = Mesh::new("interface", 2, &mut ids);
      for i in 0..distribution[&rank].len() {
        mesh.create_vertex(DVec3::new(i as f64, rank as f64, 0.0));
      }
      if rank == 0 {
        mesh.set_global_vertex_count(6);
        mesh.set_vertex_distribution(distribution.clone());
      }
      mesh.compute_distribution(&intra).unwrap();
      (rank, mesh.vertex_offsets().to_vec(), mesh.held_global_indices(), mesh.owner_flags())
    }));
  }

  for handle in handles {
    let (rank, offsets, globals, owners) = handle.join().unwrap();
    assert_eq!(offsets, vec![3, 3, 7], "offsets on rank {rank}");
    match rank {
      0 => {
        assert_eq!(globals, vec![0, 1, 3]);
        // Sweep one gives rank 0 its guess of two vertices; the duplicated
        // vertex 3 is claimed by rank 2.
        assert_eq!(owners, vec![true, true, false]);
      }
      1 => {
        assert!(globals.is_empty());
        assert!(owners.is_empty());
      }
      2 => {
        assert_eq!(globals, vec![2, 3, 4, 5]);
        assert_eq!(owners, vec![true, true, true, true]);
      }
      _ => unreachable!(),
    }
  }
}

/// Every global index has exactly one owner across ranks, and the offsets
/// are monotone with the total held count at the back.
#[test]
fn test_distribution_integrity() {
  let distribution: BTreeMap<usize, Vec<usize>> =
    [(0usize, vec![0, 1, 2, 3]), (1, vec![2, 3, 4, 5, 6, 7])].into_iter().collect();
  let network = ChannelNetwork::new();

  let mut handles = Vec::new();
  for rank in 0..2usize {
    let network = network.clone();
    let distribution = distribution.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network);
      let intra = if rank == 0 {
        IntraComm::connect_master("solid", 2, &factory).unwrap()
      } else {
        IntraComm::connect_slave("solid", rank, 2, &factory).unwrap()
      };
      let mut ids = IdAllocator::new();
      let mut mesh = Mesh::new("interface", 3, &mut ids);
      for _ in 0..distribution[&rank].len() {
        mesh.create_vertex(DVec3::ZERO);
      }
      if rank == 0 {
        mesh.set_global_vertex_count(8);
        mesh.set_vertex_distribution(distribution.clone());
      }
      mesh.compute_distribution(&intra).unwrap();
      (mesh.held_global_indices(), mesh.owner_flags(), mesh.vertex_offsets().to_vec())
    }));
  }

  let mut owner_count = vec![0usize; 8];
  for handle in handles {
    let (globals, owners, offsets) = handle.join().unwrap();
    assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "offsets non-decreasing");
    assert_eq!(*offsets.last().unwrap(), 10, "total held count");
    for (g, owned) in globals.into_iter().zip(owners) {
      if owned {
        owner_count[g] += 1;
      }
    }
  }
  assert_eq!(owner_count, vec![1; 8], "each global index owned exactly once");
}
