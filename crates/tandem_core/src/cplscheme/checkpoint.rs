//! Line-oriented checkpoint files.
//!
//! Two artifacts exist: `<prefix>_simstate.txt` with the global simulation
//! state (time, timestep, advance-call count) and `<prefix>_cplscheme.txt`
//! with per-scheme state. Both are `key: value` text; values with several
//! entries are space-separated. Backward compatibility of the format is not
//! a goal.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{CoupleError, Result};

/// Global simulation state persisted across restarts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimulationState {
  pub time: f64,
  pub timesteps: usize,
  pub advance_calls: usize,
}

impl SimulationState {
  pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut text = String::new();
    text.push_str(&format!("time: {:.17e}\n", self.time));
    text.push_str(&format!("timesteps: {}\n", self.timesteps));
    text.push_str(&format!("advance-calls: {}\n", self.advance_calls));
    fs::write(path, text)?;
    Ok(())
  }

  pub fn read(path: impl AsRef<Path>) -> Result<Self> {
    let kv = KeyValueFile::read(path)?;
    Ok(Self {
      time: kv.get_f64("time")?,
      timesteps: kv.get_usize("timesteps")?,
      advance_calls: kv.get_usize("advance-calls")?,
    })
  }
}

/// Helper for reading and writing `key: value` checkpoint files.
pub(crate) struct KeyValueFile {
  entries: BTreeMap<String, String>,
}

impl KeyValueFile {
  pub fn new() -> Self {
    Self { entries: BTreeMap::new() }
  }

  pub fn set_f64(&mut self, key: &str, value: f64) {
    self.entries.insert(key.to_string(), format!("{value:.17e}"));
  }

  pub fn set_usize(&mut self, key: &str, value: usize) {
    self.entries.insert(key.to_string(), value.to_string());
  }

  pub fn set_bool(&mut self, key: &str, value: bool) {
    self.entries.insert(key.to_string(), (value as u8).to_string());
  }

  pub fn set_f64s(&mut self, key: &str, values: &[f64]) {
    let text: Vec<String> = values.iter().map(|v| format!("{v:.17e}")).collect();
    self.entries.insert(key.to_string(), text.join(" "));
  }

  pub fn get_f64(&self, key: &str) -> Result<f64> {
    self.raw(key)?.parse().map_err(|_| Self::malformed(key))
  }

  pub fn get_usize(&self, key: &str) -> Result<usize> {
    self.raw(key)?.parse().map_err(|_| Self::malformed(key))
  }

  pub fn get_bool(&self, key: &str) -> Result<bool> {
    Ok(self.get_usize(key)? != 0)
  }

  pub fn get_f64s(&self, key: &str) -> Result<Vec<f64>> {
    let raw = self.raw(key)?;
    if raw.is_empty() {
      return Ok(Vec::new());
    }
    raw
      .split_whitespace()
      .map(|token| token.parse().map_err(|_| Self::malformed(key)))
      .collect()
  }

  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  fn raw(&self, key: &str) -> Result<&str> {
    self
      .entries
      .get(key)
      .map(String::as_str)
      .ok_or_else(|| CoupleError::Config(format!("checkpoint misses key `{key}`")))
  }

  fn malformed(key: &str) -> CoupleError {
    CoupleError::Config(format!("checkpoint value of `{key}` is malformed"))
  }

  pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
    let mut text = String::new();
    for (key, value) in &self.entries {
      text.push_str(key);
      text.push_str(": ");
      text.push_str(value);
      text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
  }

  pub fn read(path: impl AsRef<Path>) -> Result<Self> {
    let text = fs::read_to_string(path)?;
    let mut entries = BTreeMap::new();
    for line in text.lines() {
      if line.trim().is_empty() {
        continue;
      }
      let Some((key, value)) = line.split_once(':') else {
        return Err(CoupleError::Config(format!("checkpoint line without key: `{line}`")));
      };
      entries.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(Self { entries })
  }
}
