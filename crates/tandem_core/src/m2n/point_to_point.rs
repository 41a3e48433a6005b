//! Point-to-point distributed exchange.
//!
//! Field slices travel directly between overlapping rank pairs of the two
//! participants. During connection setup both sides exchange their per-rank
//! vertex assignments (held global indices plus owner flags) over the
//! master channel; every rank then derives its peer mappings locally:
//!
//! * it *sends* the vertices it owns that the peer rank holds a copy of,
//! * it *receives* the vertices it holds that the peer rank owns,
//!
//! so each global vertex is shipped exactly once per direction and fans out
//! to every rank holding a copy. Both sides walk their peer lists in
//! ascending rank order, which keeps the blocking pairwise setups and the
//! wire order aligned.

use std::collections::HashSet;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::com::{Communication, CommunicationFactory, IntraComm, PtrCommunication};
use crate::error::{CoupleError, Result};
use crate::ids::Rank;
use crate::m2n::DistributedCommunication;
use crate::mesh::PtrMesh;

/// Routing record for one remote rank.
struct Mapping {
  /// Ordinal of this peer among the connected remote ranks.
  local_remote_rank: usize,
  /// Rank of the peer inside the remote participant.
  global_remote_rank: Rank,
  /// Local value positions shipped to this peer.
  send_indices: Vec<usize>,
  /// Local value positions filled from this peer.
  recv_indices: Vec<usize>,
  com: Box<dyn Communication>,
}

/// Per-rank vertex assignment of one participant.
struct VertexAssignment {
  /// Per rank: global indices held.
  held: Vec<Vec<usize>>,
  /// Per rank: owner flag per held vertex.
  owned: Vec<Vec<bool>>,
}

impl VertexAssignment {
  /// Flat encoding: per rank `count, held..., owned(0/1)...`.
  fn encode(&self) -> Vec<usize> {
    let mut out = vec![self.held.len()];
    for (held, owned) in self.held.iter().zip(&self.owned) {
      out.push(held.len());
      out.extend_from_slice(held);
      out.extend(owned.iter().map(|&flag| flag as usize));
    }
    out
  }

  fn decode(flat: &[usize]) -> Self {
    let size = flat[0];
    let mut cursor = 1;
    let mut held = Vec::with_capacity(size);
    let mut owned = Vec::with_capacity(size);
    for _ in 0..size {
      let len = flat[cursor];
      cursor += 1;
      held.push(flat[cursor..cursor + len].to_vec());
      cursor += len;
      owned.push(flat[cursor..cursor + len].iter().map(|&f| f == 1).collect());
      cursor += len;
    }
    Self { held, owned }
  }
}

pub struct PointToPointCommunication {
  mesh: PtrMesh,
  intra: Rc<IntraComm>,
  com_factory: Rc<dyn CommunicationFactory>,
  master_com: PtrCommunication,
  mappings: Vec<Mapping>,
  local_count: usize,
  connected: bool,
}

impl PointToPointCommunication {
  pub fn new(
    mesh: PtrMesh,
    intra: Rc<IntraComm>,
    com_factory: Rc<dyn CommunicationFactory>,
    master_com: PtrCommunication,
  ) -> Self {
    Self {
      mesh,
      intra,
      com_factory,
      master_com,
      mappings: Vec::new(),
      local_count: 0,
      connected: false,
    }
  }

  /// Gathers this participant's vertex assignment on the master.
  fn local_assignment(&self) -> Result<VertexAssignment> {
    let (held, owned) = {
      let mesh = self.mesh.borrow();
      if mesh.vertex_offsets().is_empty() {
        return Err(CoupleError::NotReady(format!(
          "distribution of mesh {} not computed",
          mesh.name()
        )));
      }
      (mesh.held_global_indices(), mesh.owner_flags())
    };
    let held_lists = self.intra.gather_var_usizes(&held)?;
    let owned_flat: Vec<usize> = owned.iter().map(|&flag| flag as usize).collect();
    let owned_lists = self.intra.gather_var_usizes(&owned_flat)?;
    Ok(VertexAssignment {
      held: held_lists,
      owned: owned_lists
        .into_iter()
        .map(|list| list.into_iter().map(|f| f == 1).collect())
        .collect(),
    })
  }

  /// Exchanges assignments over the master channel and hands every rank the
  /// remote one. `acceptor_side` fixes the send/receive order.
  fn exchange_assignments(&self, acceptor_side: bool) -> Result<VertexAssignment> {
    let local = self.local_assignment()?;
    let remote_flat = if !self.intra.is_slave() {
      let com = self.master_com.borrow();
      let local_flat = local.encode();
      let remote_flat;
      if acceptor_side {
        com.send_usize(local_flat.len(), 0)?;
        com.send_usizes(&local_flat, 0)?;
        let len = com.recv_usize(0)?;
        remote_flat = com.recv_usizes(len, 0)?;
      } else {
        let len = com.recv_usize(0)?;
        remote_flat = com.recv_usizes(len, 0)?;
        com.send_usize(local_flat.len(), 0)?;
        com.send_usizes(&local_flat, 0)?;
      }
      self.intra.broadcast_var_usizes(&remote_flat)?
    } else {
      self.intra.broadcast_var_usizes(&[])?
    };
    Ok(VertexAssignment::decode(&remote_flat))
  }

  /// Derives the peer mappings of this rank and opens one channel per peer,
  /// ascending by remote rank.
  fn connect(&mut self, local: &str, remote: &str, acceptor_side: bool) -> Result<()> {
    if self.connected {
      return Err(CoupleError::AlreadyConnected(format!(
        "point-to-point channel of mesh {}",
        self.mesh.borrow().name()
      )));
    }
    let remote_assignment = self.exchange_assignments(acceptor_side)?;

    let (my_held, my_owned, mesh_name) = {
      let mesh = self.mesh.borrow();
      (mesh.held_global_indices(), mesh.owner_flags(), mesh.name().to_string())
    };
    self.local_count = my_held.len();

    for (remote_rank, (remote_held, remote_owned)) in
      remote_assignment.held.iter().zip(&remote_assignment.owned).enumerate()
    {
      let held_set: HashSet<usize> = remote_held.iter().copied().collect();
      let owned_set: HashSet<usize> =
        remote_held.iter().zip(remote_owned).filter(|(_, &o)| o).map(|(&g, _)| g).collect();

      let send_indices: Vec<usize> = my_held
        .iter()
        .enumerate()
        .filter(|&(i, g)| my_owned[i] && held_set.contains(g))
        .map(|(i, _)| i)
        .collect();
      let recv_indices: Vec<usize> =
        my_held.iter().enumerate().filter(|&(_, g)| owned_set.contains(g)).map(|(i, _)| i).collect();

      if send_indices.is_empty() && recv_indices.is_empty() {
        continue;
      }

      let mut com = self.com_factory.new_communication();
      let local_endpoint = format!("{local}-{mesh_name}-r{}", self.intra.rank());
      let remote_endpoint = format!("{remote}-{mesh_name}-r{remote_rank}");
      if acceptor_side {
        com.accept_connection(&local_endpoint, &remote_endpoint)?;
      } else {
        com.request_connection(&remote_endpoint, &local_endpoint, 0, 1)?;
      }
      debug!(
        mesh = %mesh_name,
        remote_rank,
        send = send_indices.len(),
        recv = recv_indices.len(),
        "connected peer channel"
      );
      self.mappings.push(Mapping {
        local_remote_rank: self.mappings.len(),
        global_remote_rank: remote_rank,
        send_indices,
        recv_indices,
        com,
      });
    }

    self.connected = true;
    Ok(())
  }
}

impl DistributedCommunication for PointToPointCommunication {
  fn is_connected(&self) -> bool {
    self.connected
  }

  fn accept_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
    self.connect(acceptor, requester, true)
  }

  fn request_connection(&mut self, acceptor: &str, requester: &str) -> Result<()> {
    self.connect(requester, acceptor, false)
  }

  fn close_connection(&mut self) -> Result<()> {
    for mapping in &mut self.mappings {
      mapping.com.close_connection()?;
    }
    self.mappings.clear();
    self.connected = false;
    Ok(())
  }

  fn send(&mut self, values: &[f64], value_dim: usize) -> Result<()> {
    if !self.connected {
      return Err(CoupleError::NotReady("point-to-point channel not connected".into()));
    }
    let expected = self.local_count * value_dim;
    if values.len() != expected {
      return Err(CoupleError::SizeMismatch { expected, got: values.len() });
    }

    // Post every peer's slice asynchronously, then wait; a fully blocking
    // schedule could interleave badly with the peer's own send loop.
    let mut buffers = Vec::new();
    for mapping in &self.mappings {
      if mapping.send_indices.is_empty() {
        continue;
      }
      let mut buffer = Vec::with_capacity(mapping.send_indices.len() * value_dim);
      for &i in &mapping.send_indices {
        buffer.extend_from_slice(&values[i * value_dim..(i + 1) * value_dim]);
      }
      buffers.push((mapping, buffer));
    }
    let mut requests = Vec::new();
    for (mapping, buffer) in &buffers {
      let com: &dyn Communication = mapping.com.as_ref();
      trace!(
        peer = mapping.global_remote_rank,
        ordinal = mapping.local_remote_rank,
        count = buffer.len(),
        "posting slice"
      );
      requests.push(com.asend_f64s(buffer, 0)?);
    }
    for request in requests {
      request.wait()?;
    }
    Ok(())
  }

  fn receive(&mut self, values: &mut [f64], value_dim: usize) -> Result<()> {
    if !self.connected {
      return Err(CoupleError::NotReady("point-to-point channel not connected".into()));
    }
    let expected = self.local_count * value_dim;
    if values.len() != expected {
      return Err(CoupleError::SizeMismatch { expected, got: values.len() });
    }

    for mapping in &self.mappings {
      if mapping.recv_indices.is_empty() {
        continue;
      }
      let com: &dyn Communication = mapping.com.as_ref();
      let buffer = com.recv_f64s(mapping.recv_indices.len() * value_dim, 0)?;
      for (j, &i) in mapping.recv_indices.iter().enumerate() {
        values[i * value_dim..(i + 1) * value_dim]
          .copy_from_slice(&buffer[j * value_dim..(j + 1) * value_dim]);
      }
    }
    Ok(())
  }
}
