//! Parallel mesh distribution.
//!
//! Runs once per mesh after construction and fixes its parallel identity in
//! four steps, all driven by the participant master:
//!
//! 1. broadcast the global vertex count,
//! 2. broadcast the cumulative per-rank vertex offsets,
//! 3. hand every rank the global indices of its held vertices,
//! 4. elect exactly one owner rank per global index.
//!
//! Owner election is two greedy sweeps over the recorded vertex
//! distribution. Sweep one hands each rank up to `global_count / ranks` of
//! its yet-unowned vertices; sweep two assigns every remaining vertex to
//! the first rank that holds it. Both sweeps visit ranks in ascending
//! order, so lower ranks claim first.

use tracing::{debug, warn};

use crate::com::IntraComm;
use crate::error::Result;
use crate::mesh::Mesh;

impl Mesh {
  /// Computes global indices, vertex offsets and owner flags.
  ///
  /// On the master the vertex distribution must have been recorded via
  /// [`Mesh::set_vertex_distribution`]. Vertex additions are rejected
  /// afterwards.
  pub fn compute_distribution(&mut self, intra: &IntraComm) -> Result<()> {
    if !intra.is_parallel() {
      // Single-rank participant: the local mesh is the global mesh.
      let count = self.vertices().len();
      self.set_vertex_offsets(vec![count]);
      if self.global_vertex_count().is_none() {
        self.set_global_vertex_count(count);
      }
      let indices: Vec<usize> = (0..count).collect();
      self.set_global_indices(&indices);
      self.set_owner_information(&vec![true; count]);
      self.freeze();
      return Ok(());
    }

    let size = intra.size();

    // (1) Global number of vertices.
    let mut global_count = if intra.is_master() {
      match self.global_vertex_count() {
        Some(count) => count,
        // Derive from the recorded distribution when not set explicitly.
        None => self
          .vertex_distribution()
          .values()
          .flat_map(|indices| indices.iter().copied())
          .max()
          .map_or(0, |max| max + 1),
      }
    } else {
      0
    };
    intra.broadcast_usize(&mut global_count)?;
    self.set_global_vertex_count(global_count);

    // (2) Vertex offsets (prefix sums of held counts).
    let mut offsets = vec![0usize; size];
    if intra.is_master() {
      let mut sum = 0;
      for rank in 0..size {
        sum += self.vertex_distribution().get(&rank).map_or(0, Vec::len);
        offsets[rank] = sum;
      }
    }
    intra.broadcast_usizes(&mut offsets)?;
    debug!(mesh = self.name(), ?offsets, "vertex offsets");
    self.set_vertex_offsets(offsets);

    // (3) Global indices.
    let local = self.distribute_global_indices(intra)?;
    self.set_global_indices(&local);

    // (4) Owner election.
    let owners = self.elect_owners(intra, global_count)?;
    self.set_owner_information(&owners);

    self.freeze();
    Ok(())
  }

  /// Sends each rank its slice of global indices; returns the local slice.
  fn distribute_global_indices(&self, intra: &IntraComm) -> Result<Vec<usize>> {
    let lists = if intra.is_master() {
      self.gather_lists_from_distribution(intra.size())
    } else {
      Vec::new()
    };
    intra.scatter_var_usizes(&lists)
  }

  fn gather_lists_from_distribution(&self, size: usize) -> Vec<Vec<usize>> {
    (0..size)
      .map(|rank| self.vertex_distribution().get(&rank).cloned().unwrap_or_default())
      .collect()
  }

  /// Two-sweep greedy owner election on the master; every rank receives the
  /// flags of its held vertices.
  fn elect_owners(&self, intra: &IntraComm, global_count: usize) -> Result<Vec<bool>> {
    let size = intra.size();
    if intra.is_master() {
      let lists = self.gather_lists_from_distribution(size);
      let mut globally_owned = vec![false; global_count];
      let mut owner_flags: Vec<Vec<usize>> =
        lists.iter().map(|list| vec![0; list.len()]).collect();
      let local_guess = global_count / size;

      // Sweep one: up to `local_guess` claims per rank, lower ranks first.
      for rank in 0..size {
        let mut counter = 0;
        for (i, &g) in lists[rank].iter().enumerate() {
          if !globally_owned[g] {
            owner_flags[rank][i] = 1;
            globally_owned[g] = true;
            counter += 1;
            if counter == local_guess {
              break;
            }
          }
        }
      }

      // Sweep two: whatever is left goes to the first rank holding it.
      for rank in 0..size {
        for (i, &g) in lists[rank].iter().enumerate() {
          if !globally_owned[g] {
            owner_flags[rank][i] = 1;
            globally_owned[g] = true;
          }
        }
        if lists[rank].is_empty() {
          warn!(mesh = self.name(), rank, "rank holds no vertices of this mesh");
        }
      }

      for (g, owned) in globally_owned.iter().enumerate() {
        if !owned {
          warn!(
            mesh = self.name(),
            global_index = g,
            "global vertex has no owner; it is held by no rank"
          );
        }
      }

      let own = intra.scatter_var_usizes(&owner_flags)?;
      Ok(own.iter().map(|&f| f == 1).collect())
    } else {
      let own = intra.scatter_var_usizes(&[])?;
      Ok(own.iter().map(|&f| f == 1).collect())
    }
  }
}

#[cfg(test)]
#[path = "distribution_test.rs"]
mod distribution_test;
