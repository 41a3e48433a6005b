use approx::assert_relative_eq;
use glam::DVec3;

use super::*;

fn unit_triangle_mesh(ids: &mut IdAllocator) -> Mesh {
  let mut mesh = Mesh::new("surface", 3, ids);
  let v0 = mesh.create_vertex(DVec3::new(0.0, 0.0, 0.0));
  let v1 = mesh.create_vertex(DVec3::new(1.0, 0.0, 0.0));
  let v2 = mesh.create_vertex(DVec3::new(0.0, 1.0, 0.0));
  let e0 = mesh.create_edge(v0, v1);
  let e1 = mesh.create_edge(v1, v2);
  let e2 = mesh.create_edge(v2, v0);
  mesh.create_triangle(e0, e1, e2);
  mesh
}

/// A unit triangle in the xy-plane has +z normals everywhere.
#[test]
fn test_triangle_normals() {
  let mut ids = IdAllocator::new();
  let mut mesh = unit_triangle_mesh(&mut ids);
  mesh.compute_state();

  let normal = mesh.triangles()[0].normal();
  assert_relative_eq!(normal.z, 1.0);
  for vertex in mesh.vertices() {
    assert_relative_eq!(vertex.normal().z, 1.0);
  }
}

/// Flipping inverts the computed orientation.
#[test]
fn test_flipped_normals() {
  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("surface", 3, &mut ids).with_flipped_normals();
  let v0 = mesh.create_vertex(DVec3::new(0.0, 0.0, 0.0));
  let v1 = mesh.create_vertex(DVec3::new(1.0, 0.0, 0.0));
  let v2 = mesh.create_vertex(DVec3::new(0.0, 1.0, 0.0));
  let e0 = mesh.create_edge(v0, v1);
  let e1 = mesh.create_edge(v1, v2);
  let e2 = mesh.create_edge(v2, v0);
  mesh.create_triangle(e0, e1, e2);
  mesh.compute_state();
  assert_relative_eq!(mesh.triangles()[0].normal().z, -1.0);
}

/// The bounding box spans exactly the vertex coordinates.
#[test]
fn test_bounding_box() {
  let mut ids = IdAllocator::new();
  let mut mesh = unit_triangle_mesh(&mut ids);
  mesh.compute_state();
  let (min, max) = mesh.bounding_box().unwrap();
  assert_eq!(min, DVec3::new(0.0, 0.0, 0.0));
  assert_eq!(max, DVec3::new(1.0, 1.0, 0.0));
}

/// Triangle vertices are derived from the edge loop in traversal order.
#[test]
fn test_triangle_vertex_loop() {
  let mut ids = IdAllocator::new();
  let mesh = unit_triangle_mesh(&mut ids);
  assert_eq!(mesh.triangles()[0].vertices(), [0, 1, 2]);
}

/// Data allocation sizes every field to vertex_count * dimensions.
#[test]
fn test_allocate_data_values() {
  let mut ids = IdAllocator::new();
  let mut mesh = unit_triangle_mesh(&mut ids);
  let scalar = mesh.create_data("pressure", 1, &mut ids);
  let vector = mesh.create_data("force", 3, &mut ids);
  mesh.allocate_data_values();

  assert_eq!(scalar.borrow().values().len(), 3);
  assert_eq!(vector.borrow().values().len(), 9);
  assert!(scalar.borrow().values().iter().all(|v| *v == 0.0));
}

/// Vertex additions are rejected after the distribution step.
#[test]
#[should_panic(expected = "vertex added after distribution")]
fn test_frozen_after_distribution() {
  let mut ids = IdAllocator::new();
  let mut mesh = unit_triangle_mesh(&mut ids);
  let intra = crate::com::IntraComm::serial();
  mesh.compute_distribution(&intra).unwrap();
  mesh.create_vertex(DVec3::ZERO);
}

/// A 2D mesh accumulates edge normals on its vertices.
#[test]
fn test_edge_normals_in_2d() {
  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("line", 2, &mut ids);
  let v0 = mesh.create_vertex(DVec3::new(0.0, 0.0, 0.0));
  let v1 = mesh.create_vertex(DVec3::new(1.0, 0.0, 0.0));
  mesh.create_edge(v0, v1);
  mesh.compute_state();

  // Edge along +x gets the left-hand normal (0, 1, 0) scaled to unit.
  let normal = mesh.edges()[0].normal();
  assert_relative_eq!(normal.y, 1.0);
  assert_relative_eq!(mesh.vertex(v0).normal().y, 1.0);
}
