//! Per-exchange coupling data cells.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::DMatrix;

use crate::ids::DataId;
use crate::mesh::{PtrData, PtrMesh};

/// Shared handle to a coupling data cell.
pub type PtrCouplingData = Rc<RefCell<CouplingData>>;

/// Coupling data keyed by data id; ordered, so concatenations of several
/// fields are identical on every rank.
pub type DataMap = BTreeMap<DataId, PtrCouplingData>;

/// One data field as seen by a coupling scheme.
///
/// `old_values` column 0 holds the last converged (or last iteration)
/// values; further columns hold earlier converged timesteps used for
/// extrapolation and quasi-Newton history.
pub struct CouplingData {
  pub data: PtrData,
  pub mesh: PtrMesh,
  pub old_values: DMatrix<f64>,
  /// True when this binding takes part in the initial-data exchange.
  pub requires_initialization: bool,
}

impl CouplingData {
  pub fn new(data: PtrData, mesh: PtrMesh, requires_initialization: bool) -> Self {
    Self { data, mesh, old_values: DMatrix::zeros(0, 0), requires_initialization }
  }

  pub fn id(&self) -> DataId {
    self.data.borrow().id()
  }

  pub fn dimensions(&self) -> usize {
    self.data.borrow().dimensions()
  }

  /// Copy of the current values.
  pub fn values(&self) -> Vec<f64> {
    self.data.borrow().values().to_vec()
  }

  pub fn set_values(&self, values: &[f64]) {
    self.data.borrow_mut().set_values(values);
  }

  /// Number of scalar entries in the value vector.
  pub fn len(&self) -> usize {
    self.data.borrow().values().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Makes sure `old_values` has at least `cols` columns sized to the
  /// current value vector, zero-filled on first allocation.
  pub fn ensure_old_columns(&mut self, cols: usize) {
    let rows = self.len();
    if self.old_values.nrows() != rows || self.old_values.ncols() < cols {
      let cols = cols.max(self.old_values.ncols()).max(1);
      self.old_values = DMatrix::zeros(rows, cols);
    }
  }

  /// Last-iteration values (column 0).
  pub fn old_column(&self) -> Vec<f64> {
    self.old_values.column(0).iter().copied().collect()
  }

  /// Overwrites column 0 with the current values.
  pub fn update_old(&mut self) {
    let values = self.values();
    self.ensure_old_columns(1);
    self.old_values.set_column(0, &nalgebra::DVector::from_vec(values));
  }

  /// Shifts the history (column k takes column k-1) and stores the current
  /// values as the newest converged column.
  pub fn shift_columns(&mut self) {
    self.ensure_old_columns(1);
    let cols = self.old_values.ncols();
    for k in (1..cols).rev() {
      let previous: Vec<f64> = self.old_values.column(k - 1).iter().copied().collect();
      self.old_values.set_column(k, &nalgebra::DVector::from_vec(previous));
    }
    self.update_old();
  }

  /// Writes a first- or second-order extrapolant of the converged history
  /// into the current values, used as initial guess for the next timestep.
  pub fn extrapolate(&mut self, order: usize) {
    let cols = self.old_values.ncols();
    let prediction: Vec<f64> = match order {
      1 if cols >= 2 => self
        .old_values
        .column(0)
        .iter()
        .zip(self.old_values.column(1).iter())
        .map(|(c0, c1)| 2.0 * c0 - c1)
        .collect(),
      2 if cols >= 3 => {
        let c0 = self.old_values.column(0);
        let c1 = self.old_values.column(1);
        let c2 = self.old_values.column(2);
        c0.iter()
          .zip(c1.iter())
          .zip(c2.iter())
          .map(|((a, b), c)| 2.5 * a - 2.0 * b + 0.5 * c)
          .collect()
      }
      _ => return,
    };
    self.set_values(&prediction);
  }
}

#[cfg(test)]
mod tests {
  use std::rc::Rc;

  use glam::DVec3;

  use super::*;
  use crate::ids::IdAllocator;
  use crate::mesh::Mesh;

  fn cell(values: &[f64]) -> CouplingData {
    let mut ids = IdAllocator::new();
    let mut mesh = Mesh::new("m", 2, &mut ids);
    for _ in 0..values.len() {
      mesh.create_vertex(DVec3::ZERO);
    }
    let data = mesh.create_data("d", 1, &mut ids);
    mesh.allocate_data_values();
    data.borrow_mut().set_values(values);
    CouplingData::new(data, Rc::new(RefCell::new(mesh)), false)
  }

  #[test]
  fn test_lazy_old_column_is_zero() {
    let mut cd = cell(&[1.0, 2.0]);
    cd.ensure_old_columns(1);
    assert_eq!(cd.old_column(), vec![0.0, 0.0]);
  }

  #[test]
  fn test_shift_keeps_history_order() {
    let mut cd = cell(&[1.0]);
    cd.ensure_old_columns(2);
    cd.shift_columns(); // history: [1], [0]
    cd.set_values(&[5.0]);
    cd.shift_columns(); // history: [5], [1]
    assert_eq!(cd.old_values[(0, 0)], 5.0);
    assert_eq!(cd.old_values[(0, 1)], 1.0);
  }

  #[test]
  fn test_first_order_extrapolation() {
    let mut cd = cell(&[2.0]);
    cd.ensure_old_columns(2);
    cd.shift_columns(); // [2], [0]
    cd.set_values(&[3.0]);
    cd.shift_columns(); // [3], [2]
    cd.extrapolate(1);
    assert_eq!(cd.values(), vec![4.0]); // 2*3 - 2
  }
}
