//! Shared helpers for acceleration tests.

use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec3;

use crate::cplscheme::{CouplingData, DataMap, PtrCouplingData};
use crate::ids::{DataId, IdAllocator};
use crate::mesh::Mesh;

/// Builds a data map with one scalar field per entry of `fields`, old
/// values zero-initialized.
pub fn data_map(fields: &[&[f64]]) -> (DataMap, Vec<DataId>) {
  let mut ids = IdAllocator::new();
  let mut mesh = Mesh::new("m", 2, &mut ids);
  let max_len = fields.iter().map(|f| f.len()).max().unwrap_or(0);
  for _ in 0..max_len {
    mesh.create_vertex(DVec3::ZERO);
  }
  let mesh = Rc::new(RefCell::new(mesh));

  let mut map = DataMap::new();
  let mut data_ids = Vec::new();
  for field in fields {
    let data = mesh.borrow_mut().create_data("f", 1, &mut ids);
    data.borrow_mut().set_values(field);
    let cell: PtrCouplingData =
      Rc::new(RefCell::new(CouplingData::new(data, mesh.clone(), false)));
    let id = cell.borrow().id();
    cell.borrow_mut().ensure_old_columns(1);
    data_ids.push(id);
    map.insert(id, cell);
  }
  (map, data_ids)
}
