// src/store.rs - Taught positions and their on-disk persistence
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write positions file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode positions: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A taught spatial waypoint.
///
/// When `encoder` is present it is the verbatim `M893` capture taken at teach
/// time and takes priority over the Cartesian fields for motion: replaying it
/// reproduces the arm's exact joint configuration instead of an inverse
/// kinematics solution. The Cartesian fields are still kept consistent for
/// display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub encoder: Option<String>,
}

impl Position {
    pub fn cartesian(x: f64, y: f64, z: f64) -> Self {
        Self {
            x,
            y,
            z,
            encoder: None,
        }
    }
}

/// The full set of taught positions for one loader setup.
///
/// `hooks` are addressed by index in insertion order; deleting one shifts the
/// indices of everything after it down. There are no stable hook IDs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaughtSet {
    #[serde(default)]
    pub pick: Option<Position>,
    #[serde(default)]
    pub safe_z: f64,
    #[serde(default)]
    pub hooks: Vec<Position>,
}

/// In-memory [`TaughtSet`] bound to a JSON file, rewritten wholesale on every
/// mutation so taught positions survive a crash mid-session.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    set: TaughtSet,
}

impl PositionStore {
    /// Load the store from `path`. A missing or corrupt file falls back to an
    /// empty set rather than failing startup; the operator just re-teaches.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let set = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(set) => {
                    tracing::info!("Loaded taught positions from {}", path.display());
                    set
                }
                Err(e) => {
                    tracing::warn!(
                        "Positions file {} is corrupt ({}), starting empty",
                        path.display(),
                        e
                    );
                    TaughtSet::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No positions file at {}, starting empty", path.display());
                TaughtSet::default()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read positions file {} ({}), starting empty",
                    path.display(),
                    e
                );
                TaughtSet::default()
            }
        };
        Self { path, set }
    }

    pub fn taught(&self) -> &TaughtSet {
        &self.set
    }

    pub fn set_pick(&mut self, position: Position) -> Result<(), StoreError> {
        self.set.pick = Some(position);
        self.persist()
    }

    pub fn set_safe_z(&mut self, safe_z: f64) -> Result<(), StoreError> {
        self.set.safe_z = safe_z;
        self.persist()
    }

    /// Append a hook and return its index.
    pub fn add_hook(&mut self, position: Position) -> Result<usize, StoreError> {
        self.set.hooks.push(position);
        self.persist()?;
        Ok(self.set.hooks.len() - 1)
    }

    /// Remove a hook; out-of-range indices are a no-op, not an error.
    pub fn delete_hook(&mut self, index: usize) -> Result<(), StoreError> {
        if index < self.set.hooks.len() {
            self.set.hooks.remove(index);
            self.persist()?;
        }
        Ok(())
    }

    pub fn clear_hooks(&mut self) -> Result<(), StoreError> {
        self.set.hooks.clear();
        self.persist()
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.set)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!("Persisted taught positions to {}", self.path.display());
        Ok(())
    }
}
