//! Interface quasi-Newton with an explicit multi-vector Jacobian.
//!
//! Besides the per-timestep secant history this variant carries the inverse
//! Jacobian approximation across timesteps:
//!
//! `J_k = J_prev + (W - J_prev V) (V^T V)^-1 V^T`, update `x <- x_tilde - J_k r`.
//!
//! Each rank stores its column block `(n_global x n_local)` of `J`. The
//! product `W_til Z` is square in the global dimension and runs over the
//! cyclic ring of [`ParallelMatrixOperations`]; the products with `V` and
//! `r` reduce over all ranks.

use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::{DMatrix, DVector};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::acceleration::iqn_ils::{
  update_difference_histories, validate_settings, DifferenceHistory, QuasiNewtonSettings,
};
use crate::acceleration::parallel_matrix::ParallelMatrixOperations;
use crate::acceleration::{
  concat_old, concat_values, concatenated_len, ensure_old_columns, split_per_data, write_back,
  Acceleration,
};
use crate::com::{CommunicationFactory, IntraComm};
use crate::cplscheme::DataMap;
use crate::error::Result;
use crate::ids::DataId;

pub struct IqnImvjAcceleration {
  initial_relaxation: f64,
  timesteps_reused: usize,
  data_ids: SmallVec<[DataId; 2]>,
  intra: Rc<IntraComm>,
  matrix_ops: ParallelMatrixOperations,

  v: DifferenceHistory,
  w: DifferenceHistory,
  old_residual: Option<DVector<f64>>,
  old_xtilde: Option<DVector<f64>>,
  design_specification: Vec<f64>,
  timestep: usize,

  /// Exclusive prefix of per-rank entry counts; `offsets[size]` is the
  /// global length of the stacked data vector.
  offsets: Vec<usize>,
  /// Converged inverse Jacobian of the previous timestep, column block.
  jacobian_prev: Option<DMatrix<f64>>,
  /// Inverse Jacobian of the current iteration, column block.
  jacobian: Option<DMatrix<f64>>,
}

impl IqnImvjAcceleration {
  /// The ring channels are built eagerly so both participants connect them
  /// at the same point of the setup.
  pub fn new(
    settings: QuasiNewtonSettings,
    intra: Rc<IntraComm>,
    com_factory: &dyn CommunicationFactory,
    ring_tag: &str,
  ) -> Result<Self> {
    validate_settings(&settings)?;
    let matrix_ops = ParallelMatrixOperations::connect_ring(&intra, com_factory, ring_tag)?;
    Ok(Self {
      initial_relaxation: settings.initial_relaxation,
      timesteps_reused: settings.timesteps_reused,
      data_ids: settings.data_ids.iter().copied().collect(),
      intra,
      matrix_ops,
      v: DifferenceHistory::new(settings.max_used_iterations),
      w: DifferenceHistory::new(settings.max_used_iterations),
      old_residual: None,
      old_xtilde: None,
      design_specification: Vec::new(),
      timestep: 0,
      offsets: Vec::new(),
      jacobian_prev: None,
      jacobian: None,
    })
  }

  fn underrelax(&self, values: &[f64], old: &[f64]) -> Vec<f64> {
    let omega = self.initial_relaxation;
    values.iter().zip(old.iter()).map(|(v, o)| omega * v + (1.0 - omega) * o).collect()
  }

  fn n_local(&self) -> usize {
    let rank = self.intra.rank();
    self.offsets[rank + 1] - self.offsets[rank]
  }

  fn n_global(&self) -> usize {
    *self.offsets.last().expect("initialized offsets")
  }

  /// `x_tilde - J r` with `J` stored as column blocks.
  fn apply_inverse_jacobian(
    &self,
    jacobian: &DMatrix<f64>,
    values: &DVector<f64>,
    residual: &DVector<f64>,
  ) -> Result<DVector<f64>> {
    let local_rows =
      ParallelMatrixOperations::apply_column_block(jacobian, residual.as_slice(), &self.offsets, &self.intra)?;
    Ok(values - DVector::from_vec(local_rows))
  }
}

impl Acceleration for IqnImvjAcceleration {
  fn data_ids(&self) -> &[DataId] {
    &self.data_ids
  }

  fn initialize(&mut self, data: &DataMap) -> Result<()> {
    let entries = concatenated_len(&self.data_ids, data)?;
    self.design_specification = vec![0.0; entries];
    let counts = self.intra.allgather_usize(entries)?;
    self.offsets = std::iter::once(0)
      .chain(counts.iter().scan(0, |sum, &count| {
        *sum += count;
        Some(*sum)
      }))
      .collect();
    ensure_old_columns(data);
    Ok(())
  }

  fn perform(&mut self, data: &DataMap) -> Result<()> {
    let values = DVector::from_vec(concat_values(&self.data_ids, data));
    let old = DVector::from_vec(concat_old(&self.data_ids, data));
    let residual = &values - &old;

    update_difference_histories(
      &residual,
      &values,
      &mut self.old_residual,
      &mut self.old_xtilde,
      &mut self.v,
      &mut self.w,
      self.timestep,
    );

    if self.v.is_empty() {
      // First iteration: reuse the previous Jacobian if one exists.
      let updated = match self.jacobian_prev.as_ref() {
        Some(jacobian) => {
          debug!("first iteration, applying previous inverse Jacobian");
          self.apply_inverse_jacobian(jacobian, &values, &residual)?
        }
        None => DVector::from_vec(self.underrelax(values.as_slice(), old.as_slice())),
      };
      write_back(&self.data_ids, data, updated.as_slice());
      return Ok(());
    }

    let m = self.v.len();
    let n_local = self.n_local();
    let n_global = self.n_global();
    let v_local = self.v.as_matrix(n_local);
    let w_local = self.w.as_matrix(n_local);

    // Z = (V^T V)^-1 V^T, column block (m x n_local), via the distributed
    // normal matrix and a local solve per column.
    let mut normal = DMatrix::zeros(m, m);
    for i in 0..m {
      for j in i..m {
        let entry = self.intra.dot(self.v.column(i).as_slice(), self.v.column(j).as_slice())?;
        normal[(i, j)] = entry;
        normal[(j, i)] = entry;
      }
    }
    let z_local = match normal.lu().solve(&v_local.transpose()) {
      Some(z) if z.iter().all(|x| x.is_finite()) => z,
      _ => {
        warn!("singular multi-vector system, falling back to relaxation for this iteration");
        let relaxed = self.underrelax(values.as_slice(), old.as_slice());
        write_back(&self.data_ids, data, &relaxed);
        return Ok(());
      }
    };

    // W_til = W - J_prev V, rows of this rank.
    let w_til = match self.jacobian_prev.as_ref() {
      Some(jacobian) => {
        let jv = ParallelMatrixOperations::accumulate_column_block(jacobian, &v_local, &self.intra)?;
        let rank = self.intra.rank();
        let jv_rows = jv.rows(self.offsets[rank], n_local).into_owned();
        &w_local - jv_rows
      }
      None => w_local.clone(),
    };

    // Jacobian update J = J_prev + W_til Z over the cyclic ring.
    let mut jacobian = self.matrix_ops.multiply_nn(&w_til, &z_local, &self.offsets, &self.intra)?;
    if let Some(previous) = self.jacobian_prev.as_ref() {
      jacobian += previous;
    }
    debug_assert_eq!(jacobian.nrows(), n_global);

    let updated = self.apply_inverse_jacobian(&jacobian, &values, &residual)?;
    self.jacobian = Some(jacobian);
    write_back(&self.data_ids, data, updated.as_slice());
    Ok(())
  }

  fn iterations_converged(&mut self, _data: &DataMap) -> Result<()> {
    if let Some(jacobian) = self.jacobian.take() {
      self.jacobian_prev = Some(jacobian);
    }
    self.old_residual = None;
    self.old_xtilde = None;
    self.timestep += 1;
    if self.timesteps_reused == 0 {
      self.v.clear();
      self.w.clear();
    } else {
      self.v.retire(self.timestep, self.timesteps_reused);
      self.w.retire(self.timestep, self.timesteps_reused);
    }
    Ok(())
  }

  fn set_design_specification(&mut self, q: &[f64]) -> Result<()> {
    self.design_specification = q.to_vec();
    Ok(())
  }

  fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, Vec<f64>> {
    split_per_data(&self.data_ids, data, &self.design_specification)
  }
}
