//! Manifold-mapping surrogate acceleration.
//!
//! Operates on two data groups: the *fine* response of the expensive model
//! and the *coarse* response of a surrogate. From the per-iteration
//! residual differences of both groups it estimates a linear response map
//! `T ~= C F^+` and translates the fine target `q_f` into a coarse design
//! specification `q_c = c_k + C a`, with `a` the least-squares coefficients
//! of `q_f - f_k` in the fine difference basis. The coarse specification is
//! handed to the convergence measures; the values themselves are blended
//! with a fixed relaxation factor.

use std::collections::BTreeMap;
use std::rc::Rc;

use nalgebra::DVector;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::acceleration::iqn_ils::{solve_least_squares, DifferenceHistory};
use crate::acceleration::{
  concat_old, concat_values, concatenated_len, ensure_old_columns, write_back, Acceleration,
};
use crate::com::IntraComm;
use crate::cplscheme::DataMap;
use crate::error::{CoupleError, Result};
use crate::ids::DataId;

pub struct ManifoldMapping {
  relaxation: f64,
  fine_ids: SmallVec<[DataId; 2]>,
  coarse_ids: SmallVec<[DataId; 2]>,
  all_ids: Vec<DataId>,
  intra: Rc<IntraComm>,

  /// Fine residual differences across iterations.
  fine_history: DifferenceHistory,
  /// Coarse residual differences, column-aligned with `fine_history`.
  coarse_history: DifferenceHistory,
  old_fine_residual: Option<DVector<f64>>,
  old_coarse_residual: Option<DVector<f64>>,

  /// Fine-space target residual.
  fine_specification: Vec<f64>,
  /// Mapped coarse-space target, refreshed every iteration.
  coarse_specification: Vec<f64>,
  timestep: usize,
}

impl ManifoldMapping {
  pub fn new(
    relaxation: f64,
    fine_ids: impl IntoIterator<Item = DataId>,
    coarse_ids: impl IntoIterator<Item = DataId>,
    max_used_iterations: usize,
    intra: Rc<IntraComm>,
  ) -> Result<Self> {
    if relaxation <= 0.0 || relaxation > 1.0 {
      return Err(CoupleError::Config(format!(
        "manifold-mapping relaxation factor has to be in (0; 1], got {relaxation}"
      )));
    }
    let fine_ids: SmallVec<[DataId; 2]> = fine_ids.into_iter().collect();
    let coarse_ids: SmallVec<[DataId; 2]> = coarse_ids.into_iter().collect();
    if fine_ids.is_empty() || coarse_ids.is_empty() {
      return Err(CoupleError::Config(
        "manifold mapping needs one fine and one coarse data group".into(),
      ));
    }
    let all_ids = fine_ids.iter().chain(coarse_ids.iter()).copied().collect();
    Ok(Self {
      relaxation,
      fine_ids,
      coarse_ids,
      all_ids,
      intra,
      fine_history: DifferenceHistory::new(max_used_iterations),
      coarse_history: DifferenceHistory::new(max_used_iterations),
      old_fine_residual: None,
      old_coarse_residual: None,
      fine_specification: Vec::new(),
      coarse_specification: Vec::new(),
      timestep: 0,
    })
  }

  fn residual(ids: &[DataId], data: &DataMap) -> DVector<f64> {
    let values = DVector::from_vec(concat_values(ids, data));
    let old = DVector::from_vec(concat_old(ids, data));
    values - old
  }
}

impl Acceleration for ManifoldMapping {
  fn data_ids(&self) -> &[DataId] {
    &self.all_ids
  }

  fn initialize(&mut self, data: &DataMap) -> Result<()> {
    let fine_entries = concatenated_len(&self.fine_ids, data)?;
    let coarse_entries = concatenated_len(&self.coarse_ids, data)?;
    self.fine_specification = vec![0.0; fine_entries];
    self.coarse_specification = vec![0.0; coarse_entries];
    ensure_old_columns(data);
    Ok(())
  }

  fn perform(&mut self, data: &DataMap) -> Result<()> {
    let fine_residual = Self::residual(&self.fine_ids, data);
    let coarse_residual = Self::residual(&self.coarse_ids, data);

    if let (Some(prev_f), Some(prev_c)) =
      (self.old_fine_residual.as_ref(), self.old_coarse_residual.as_ref())
    {
      self.fine_history.push(&fine_residual - prev_f, self.timestep);
      self.coarse_history.push(&coarse_residual - prev_c, self.timestep);
    }

    // Fine-space defect towards the target.
    let q_f = DVector::from_column_slice(&self.fine_specification);
    let defect = &q_f - &fine_residual;

    // Map the defect into the coarse space through the difference bases.
    // Without a basis the map degrades to identity (equal group sizes) or
    // to a zero shift.
    let fallback = || {
      if defect.len() == coarse_residual.len() {
        defect.clone()
      } else {
        DVector::zeros(coarse_residual.len())
      }
    };
    let mapped_defect = if self.fine_history.is_empty() {
      fallback()
    } else {
      match solve_least_squares(&self.fine_history, &(-&defect), &self.intra)? {
        Some(coefficients) => {
          debug!(columns = self.fine_history.len(), "manifold response map applied");
          let rows = coarse_residual.len();
          self.coarse_history.as_matrix(rows) * coefficients
        }
        None => {
          warn!("singular manifold basis, using the fallback response map");
          fallback()
        }
      }
    };
    let q_c = &coarse_residual + &mapped_defect;
    self.coarse_specification = q_c.iter().copied().collect();

    // Blend all configured values towards the previous iterate.
    let values = concat_values(&self.all_ids, data);
    let old = concat_old(&self.all_ids, data);
    let omega = self.relaxation;
    let relaxed: Vec<f64> =
      values.iter().zip(old.iter()).map(|(v, o)| omega * v + (1.0 - omega) * o).collect();
    write_back(&self.all_ids, data, &relaxed);

    self.old_fine_residual = Some(fine_residual);
    self.old_coarse_residual = Some(coarse_residual);
    Ok(())
  }

  fn iterations_converged(&mut self, _data: &DataMap) -> Result<()> {
    self.old_fine_residual = None;
    self.old_coarse_residual = None;
    self.timestep += 1;
    self.fine_history.clear();
    self.coarse_history.clear();
    self.coarse_specification.iter_mut().for_each(|q| *q = 0.0);
    Ok(())
  }

  fn set_design_specification(&mut self, q: &[f64]) -> Result<()> {
    if q.len() != self.fine_specification.len() {
      return Err(CoupleError::Config(format!(
        "manifold-mapping design specification has {} entries, expected {}",
        q.len(),
        self.fine_specification.len()
      )));
    }
    self.fine_specification = q.to_vec();
    Ok(())
  }

  fn design_specification(&self, data: &DataMap) -> BTreeMap<DataId, Vec<f64>> {
    let mut out = BTreeMap::new();
    let mut offset = 0;
    for id in self.fine_ids.iter() {
      let len = data[id].borrow().len();
      out.insert(*id, self.fine_specification[offset..offset + len].to_vec());
      offset += len;
    }
    offset = 0;
    for id in self.coarse_ids.iter() {
      let len = data[id].borrow().len();
      out.insert(*id, self.coarse_specification[offset..offset + len].to_vec());
      offset += len;
    }
    out
  }
}
