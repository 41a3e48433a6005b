use std::thread;

use approx::assert_relative_eq;

use super::*;
use crate::com::channel::{ChannelCommunicationFactory, ChannelNetwork};

/// Runs `body(rank)` on `size` rank threads wired into one participant.
fn with_group<F>(size: usize, body: F)
where
  F: Fn(IntraComm) + Send + Sync + 'static,
{
  let network = ChannelNetwork::new();
  let body = std::sync::Arc::new(body);
  let mut handles = Vec::new();
  for rank in 0..size {
    let network = network.clone();
    let body = body.clone();
    handles.push(thread::spawn(move || {
      let factory = ChannelCommunicationFactory::new(network);
      let intra = if rank == 0 {
        IntraComm::connect_master("group", size, &factory).unwrap()
      } else {
        IntraComm::connect_slave("group", rank, size, &factory).unwrap()
      };
      body(intra);
    }));
  }
  for handle in handles {
    handle.join().unwrap();
  }
}

/// Serial mode computes plain local products.
#[test]
fn test_serial_dot_and_norm() {
  let intra = IntraComm::serial();
  assert_eq!(intra.dot(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), 11.0);
  assert_relative_eq!(intra.l2norm(&[3.0, 4.0]).unwrap(), 5.0);
}

/// Two ranks: dot includes both partial sums and agrees on both ranks.
/// Rank 0 holds [1, 2] / [4, 5], rank 1 holds [3] / [6].
#[test]
fn test_distributed_dot_includes_all_ranks() {
  with_group(2, |intra| {
    let (u, v): (Vec<f64>, Vec<f64>) = if intra.rank() == 0 {
      (vec![1.0, 2.0], vec![4.0, 5.0])
    } else {
      (vec![3.0], vec![6.0])
    };
    let dot = intra.dot(&u, &v).unwrap();
    assert_eq!(dot, 32.0);
  });
}

/// Broadcast delivers the master's buffer to every slave.
#[test]
fn test_broadcast() {
  with_group(3, |intra| {
    let mut buf = if intra.is_master() { vec![1.5, 2.5] } else { vec![0.0, 0.0] };
    intra.broadcast_f64s(&mut buf).unwrap();
    assert_eq!(buf, vec![1.5, 2.5]);
  });
}

/// All-reduce sums contributions of all ranks everywhere.
#[test]
fn test_allreduce_sum() {
  with_group(3, |intra| {
    let local = [(intra.rank() + 1) as f64];
    let mut out = [0.0];
    intra.allreduce_sum_f64s(&local, &mut out).unwrap();
    assert_eq!(out[0], 6.0);
  });
}

/// Allgather returns per-rank values in rank order on every rank.
#[test]
fn test_allgather() {
  with_group(3, |intra| {
    let all = intra.allgather_usize(10 * intra.rank() + 1).unwrap();
    assert_eq!(all, vec![1, 11, 21]);
  });
}

/// WRMS norm matches the closed form on distributed data.
#[test]
fn test_distributed_wrms_norm() {
  with_group(2, |intra| {
    // Global vector [1, 1, 1, 1] with weights [2, 2, 2, 2]:
    // sqrt(sum (2*1)^2 / 4) = 2.
    let (v, w): (Vec<f64>, Vec<f64>) = if intra.rank() == 0 {
      (vec![1.0, 1.0, 1.0], vec![2.0, 2.0, 2.0])
    } else {
      (vec![1.0], vec![2.0])
    };
    let norm = intra.wrms_norm(&v, &w).unwrap();
    assert_relative_eq!(norm, 2.0);
  });
}

/// Gather and scatter move per-rank slices through the master.
#[test]
fn test_gather_scatter_slices() {
  with_group(2, |intra| {
    let local = if intra.rank() == 0 { vec![1.0] } else { vec![2.0, 3.0] };
    let gathered = intra.gather_f64s(&local, &[1, 2]).unwrap();
    if intra.is_master() {
      assert_eq!(gathered, vec![vec![1.0], vec![2.0, 3.0]]);
      let back = intra.scatter_f64s(&[vec![10.0], vec![20.0, 30.0]], 1).unwrap();
      assert_eq!(back, vec![10.0]);
    } else {
      let back = intra.scatter_f64s(&[], 2).unwrap();
      assert_eq!(back, vec![20.0, 30.0]);
    }
  });
}
