//! Process-wide identifier allocation for meshes and data fields.
//!
//! Identifiers come from an explicit [`IdAllocator`] service that is created
//! once per configuration run and passed to whoever creates meshes or data
//! fields. Tests create a fresh allocator each, so id sequences never leak
//! between runs.

/// Identifier of a mesh, unique per [`IdAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub usize);

/// Identifier of a data field, unique per [`IdAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId(pub usize);

/// Rank of a process inside a participant, or inside a remote participant.
pub type Rank = usize;

/// Allocates mesh and data ids from two independent counters.
#[derive(Debug, Default)]
pub struct IdAllocator {
  next_mesh: usize,
  next_data: usize,
}

impl IdAllocator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn next_mesh_id(&mut self) -> MeshId {
    let id = MeshId(self.next_mesh);
    self.next_mesh += 1;
    id
  }

  pub fn next_data_id(&mut self) -> DataId {
    let id = DataId(self.next_data);
    self.next_data += 1;
    id
  }
}
