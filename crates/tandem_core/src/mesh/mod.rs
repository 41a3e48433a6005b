//! Coupling-interface meshes.
//!
//! A mesh owns flat tables of vertices, edges, triangles and quads; higher
//! primitives reference lower ones by index, so there are no pointer cycles.
//! Derived quantities (normals, bounding box) are cache recomputed by
//! [`Mesh::compute_state`] from raw coordinates, never truth.
//!
//! Vertices additionally carry the parallel identity of the mesh: a global
//! index unique across all ranks of the owning participant and an owner flag
//! electing exactly one rank per global index (see [`distribution`]).

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use glam::DVec3;
use rayon::prelude::*;

use crate::ids::{DataId, IdAllocator, MeshId, Rank};

pub mod data;
pub mod distribution;

pub use data::{Data, PtrData};

/// Shared handle to a mesh.
pub type PtrMesh = Rc<RefCell<Mesh>>;

/// A vertex of the coupling surface.
#[derive(Clone, Debug)]
pub struct Vertex {
  coords: DVec3,
  normal: DVec3,
  global_index: usize,
  owner: bool,
}

impl Vertex {
  pub fn coords(&self) -> DVec3 {
    self.coords
  }

  pub fn normal(&self) -> DVec3 {
    self.normal
  }

  pub fn global_index(&self) -> usize {
    self.global_index
  }

  pub fn is_owner(&self) -> bool {
    self.owner
  }
}

/// An edge between two vertices.
#[derive(Clone, Debug)]
pub struct Edge {
  vertices: [usize; 2],
  normal: DVec3,
}

impl Edge {
  pub fn vertices(&self) -> [usize; 2] {
    self.vertices
  }

  pub fn normal(&self) -> DVec3 {
    self.normal
  }
}

/// A triangle referencing three edges (and, derived, three vertices).
#[derive(Clone, Debug)]
pub struct Triangle {
  edges: [usize; 3],
  vertices: [usize; 3],
  normal: DVec3,
}

impl Triangle {
  pub fn edges(&self) -> [usize; 3] {
    self.edges
  }

  pub fn vertices(&self) -> [usize; 3] {
    self.vertices
  }

  pub fn normal(&self) -> DVec3 {
    self.normal
  }
}

/// A quad referencing four edges in cyclic order.
#[derive(Clone, Debug)]
pub struct Quad {
  edges: [usize; 4],
  vertices: [usize; 4],
  normal: DVec3,
}

impl Quad {
  pub fn vertices(&self) -> [usize; 4] {
    self.vertices
  }

  pub fn normal(&self) -> DVec3 {
    self.normal
  }
}

/// Ordered arena of coupling-surface primitives plus the data fields bound
/// to them.
pub struct Mesh {
  name: String,
  id: MeshId,
  dimensions: usize,
  flip_normals: bool,
  vertices: Vec<Vertex>,
  edges: Vec<Edge>,
  triangles: Vec<Triangle>,
  quads: Vec<Quad>,
  data: Vec<PtrData>,
  /// Per-rank held global indices; recorded on the master during
  /// decomposition and consulted by distribution and exchange setup.
  vertex_distribution: BTreeMap<Rank, Vec<usize>>,
  /// Cumulative held-vertex counts per rank (prefix sums).
  vertex_offsets: Vec<usize>,
  global_vertex_count: Option<usize>,
  bounding_box: Option<(DVec3, DVec3)>,
  frozen: bool,
}

impl Mesh {
  pub fn new(name: impl Into<String>, dimensions: usize, ids: &mut IdAllocator) -> Self {
    assert!(
      dimensions == 2 || dimensions == 3,
      "mesh dimensionality must be 2 or 3"
    );
    Self {
      name: name.into(),
      id: ids.next_mesh_id(),
      dimensions,
      flip_normals: false,
      vertices: Vec::new(),
      edges: Vec::new(),
      triangles: Vec::new(),
      quads: Vec::new(),
      data: Vec::new(),
      vertex_distribution: BTreeMap::new(),
      vertex_offsets: Vec::new(),
      global_vertex_count: None,
      bounding_box: None,
      frozen: false,
    }
  }

  /// Flip the orientation of all computed normals.
  pub fn with_flipped_normals(mut self) -> Self {
    self.flip_normals = true;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn id(&self) -> MeshId {
    self.id
  }

  pub fn dimensions(&self) -> usize {
    self.dimensions
  }

  // ---------------------------------------------------------------------
  // Construction
  // ---------------------------------------------------------------------

  /// Adds a vertex and returns its local id.
  ///
  /// Panics once the distribution has been computed; the parallel identity
  /// of the mesh is fixed from that point on.
  pub fn create_vertex(&mut self, coords: DVec3) -> usize {
    assert!(!self.frozen, "vertex added after distribution was computed");
    self.vertices.push(Vertex {
      coords,
      normal: DVec3::ZERO,
      global_index: 0,
      owner: false,
    });
    self.vertices.len() - 1
  }

  pub fn create_edge(&mut self, v0: usize, v1: usize) -> usize {
    assert!(v0 < self.vertices.len() && v1 < self.vertices.len());
    self.edges.push(Edge { vertices: [v0, v1], normal: DVec3::ZERO });
    self.edges.len() - 1
  }

  /// Adds a triangle from three edges forming a closed loop.
  pub fn create_triangle(&mut self, e0: usize, e1: usize, e2: usize) -> usize {
    let vertices = self.loop_vertices(&[e0, e1, e2]);
    self.triangles.push(Triangle {
      edges: [e0, e1, e2],
      vertices: [vertices[0], vertices[1], vertices[2]],
      normal: DVec3::ZERO,
    });
    self.triangles.len() - 1
  }

  /// Adds a quad from four edges forming a closed loop.
  pub fn create_quad(&mut self, e0: usize, e1: usize, e2: usize, e3: usize) -> usize {
    let vertices = self.loop_vertices(&[e0, e1, e2, e3]);
    self.quads.push(Quad {
      edges: [e0, e1, e2, e3],
      vertices: [vertices[0], vertices[1], vertices[2], vertices[3]],
      normal: DVec3::ZERO,
    });
    self.quads.len() - 1
  }

  /// Walks a closed edge loop and returns its vertices in traversal order.
  fn loop_vertices(&self, edges: &[usize]) -> Vec<usize> {
    let first = &self.edges[edges[0]];
    let second = &self.edges[edges[1]];
    // Orient the first edge so that its tail is not shared with the second.
    let mut current = if second.vertices.contains(&first.vertices[1]) {
      vec![first.vertices[0], first.vertices[1]]
    } else {
      vec![first.vertices[1], first.vertices[0]]
    };
    for &edge in &edges[1..edges.len() - 1] {
      let e = &self.edges[edge];
      let last = *current.last().expect("loop has vertices");
      let next = if e.vertices[0] == last { e.vertices[1] } else { e.vertices[0] };
      current.push(next);
    }
    current
  }

  /// Creates a data field bound to this mesh.
  ///
  /// `dimensions` is 1 for scalar data or the mesh dimensionality for
  /// vector data.
  pub fn create_data(
    &mut self,
    name: impl Into<String>,
    dimensions: usize,
    ids: &mut IdAllocator,
  ) -> PtrData {
    assert!(
      dimensions == 1 || dimensions == self.dimensions,
      "data dimensionality must be 1 or match the mesh"
    );
    let data = Rc::new(RefCell::new(Data::new(name, ids.next_data_id(), dimensions)));
    self.data.push(data.clone());
    data
  }

  /// Sizes every data field to `vertex_count * dimensions`, zero-filled.
  pub fn allocate_data_values(&mut self) {
    for data in &self.data {
      data.borrow_mut().resize_for(self.vertices.len());
    }
  }

  // ---------------------------------------------------------------------
  // Access
  // ---------------------------------------------------------------------

  pub fn vertices(&self) -> &[Vertex] {
    &self.vertices
  }

  pub fn vertex(&self, id: usize) -> &Vertex {
    &self.vertices[id]
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  pub fn triangles(&self) -> &[Triangle] {
    &self.triangles
  }

  pub fn quads(&self) -> &[Quad] {
    &self.quads
  }

  pub fn data(&self) -> &[PtrData] {
    &self.data
  }

  pub fn data_by_id(&self, id: DataId) -> Option<PtrData> {
    self.data.iter().find(|d| d.borrow().id() == id).cloned()
  }

  pub fn bounding_box(&self) -> Option<(DVec3, DVec3)> {
    self.bounding_box
  }

  // ---------------------------------------------------------------------
  // Parallel identity
  // ---------------------------------------------------------------------

  /// Records which rank holds which global indices; master side input of
  /// [`distribution::compute`].
  pub fn set_vertex_distribution(&mut self, distribution: BTreeMap<Rank, Vec<usize>>) {
    self.vertex_distribution = distribution;
  }

  pub fn vertex_distribution(&self) -> &BTreeMap<Rank, Vec<usize>> {
    &self.vertex_distribution
  }

  pub fn set_global_vertex_count(&mut self, count: usize) {
    self.global_vertex_count = Some(count);
  }

  pub fn global_vertex_count(&self) -> Option<usize> {
    self.global_vertex_count
  }

  pub fn vertex_offsets(&self) -> &[usize] {
    &self.vertex_offsets
  }

  /// Global indices of the local vertices, in vertex order.
  pub fn held_global_indices(&self) -> Vec<usize> {
    self.vertices.iter().map(|v| v.global_index).collect()
  }

  /// Owner flags of the local vertices, in vertex order.
  pub fn owner_flags(&self) -> Vec<bool> {
    self.vertices.iter().map(|v| v.owner).collect()
  }

  pub(crate) fn set_global_indices(&mut self, global_indices: &[usize]) {
    assert_eq!(global_indices.len(), self.vertices.len());
    for (vertex, &g) in self.vertices.iter_mut().zip(global_indices) {
      vertex.global_index = g;
    }
  }

  pub(crate) fn set_owner_information(&mut self, owners: &[bool]) {
    assert_eq!(owners.len(), self.vertices.len());
    for (vertex, &flag) in self.vertices.iter_mut().zip(owners) {
      vertex.owner = flag;
    }
  }

  pub(crate) fn set_vertex_offsets(&mut self, offsets: Vec<usize>) {
    self.vertex_offsets = offsets;
  }

  pub(crate) fn freeze(&mut self) {
    self.frozen = true;
  }

  // ---------------------------------------------------------------------
  // Derived state
  // ---------------------------------------------------------------------

  /// Recomputes normals and the bounding box from raw coordinates.
  pub fn compute_state(&mut self) {
    for vertex in &mut self.vertices {
      vertex.normal = DVec3::ZERO;
    }

    // Area-weighted triangle normals, computed in parallel, accumulated
    // onto vertices afterwards.
    let vertices = &self.vertices;
    let tri_normals: Vec<DVec3> = self
      .triangles
      .par_iter()
      .map(|t| {
        let [a, b, c] = t.vertices;
        let ab = vertices[b].coords - vertices[a].coords;
        let ac = vertices[c].coords - vertices[a].coords;
        ab.cross(ac) * 0.5
      })
      .collect();
    let quad_normals: Vec<DVec3> = self
      .quads
      .par_iter()
      .map(|q| {
        let [a, b, c, d] = q.vertices;
        let diag0 = vertices[c].coords - vertices[a].coords;
        let diag1 = vertices[d].coords - vertices[b].coords;
        diag0.cross(diag1) * 0.5
      })
      .collect();

    let sign = if self.flip_normals { -1.0 } else { 1.0 };
    for (triangle, normal) in self.triangles.iter_mut().zip(&tri_normals) {
      triangle.normal = sign * normal.normalize_or_zero();
      for v in triangle.vertices {
        self.vertices[v].normal += sign * *normal;
      }
    }
    for (quad, normal) in self.quads.iter_mut().zip(&quad_normals) {
      quad.normal = sign * normal.normalize_or_zero();
      for v in quad.vertices {
        self.vertices[v].normal += sign * *normal;
      }
    }

    // In 2D the edges carry the surface orientation.
    if self.dimensions == 2 {
      for edge in &mut self.edges {
        let [a, b] = edge.vertices;
        let dir = self.vertices[b].coords - self.vertices[a].coords;
        let normal = DVec3::new(-dir.y, dir.x, 0.0) * sign;
        edge.normal = normal.normalize_or_zero();
        self.vertices[a].normal += normal;
        self.vertices[b].normal += normal;
      }
    }

    for vertex in &mut self.vertices {
      vertex.normal = vertex.normal.normalize_or_zero();
    }

    self.bounding_box = if self.vertices.is_empty() {
      None
    } else {
      let mut min = DVec3::splat(f64::INFINITY);
      let mut max = DVec3::splat(f64::NEG_INFINITY);
      for vertex in &self.vertices {
        min = min.min(vertex.coords);
        max = max.max(vertex.coords);
      }
      Some((min, max))
    };
  }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
