// Checkpoint management for one training run
//
// Everything for a run lives under `<checkpoints_dir>/<run_id>/`: tagged model
// checkpoints and `validation_results.json`.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::state::ValidationResults;
use crate::errors::VqaError;
use crate::models::{load_model_metadata, CheckpointTag, ModelMetadata, VqaModel};

pub const RESULTS_FILENAME: &str = "validation_results.json";

pub struct CheckpointManager {
    /// Run directory
    run_dir: PathBuf,
    /// Checkpoints written by this manager
    written: usize,
}

impl CheckpointManager {
    /// Create the run directory if needed
    pub fn new(checkpoints_dir: &Path, run_id: &str) -> Result<Self> {
        let run_dir = checkpoints_dir.join(run_id);
        fs::create_dir_all(&run_dir).map_err(|e| VqaError::io(&run_dir, e))?;

        Ok(Self { run_dir, written: 0 })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Save `model` under `tag`, replacing an earlier checkpoint with the same tag
    pub fn save(&mut self, model: &dyn VqaModel, tag: CheckpointTag) -> Result<PathBuf> {
        let path = model
            .save(&self.run_dir, tag)
            .with_context(|| format!("Failed to save checkpoint {} in {:?}", tag, self.run_dir))?;
        self.written += 1;

        tracing::info!(tag = %tag, path = %path.display(), "Created checkpoint");
        Ok(path)
    }

    /// Write `validation_results.json` atomically
    pub fn write_results(&self, results: &ValidationResults) -> Result<PathBuf> {
        let path = self.run_dir.join(RESULTS_FILENAME);
        let json = serde_json::to_string_pretty(results)
            .context("Failed to serialize validation results")?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.run_dir)
            .map_err(|e| VqaError::io(&self.run_dir, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| VqaError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| VqaError::io(&path, e.error))?;

        tracing::info!(path = %path.display(), epochs = results.len(), "Wrote validation results");
        Ok(path)
    }

    /// Metadata of every checkpoint in the run directory, epoch tags first in order, BEST last
    pub fn list_checkpoints(&self) -> Result<Vec<ModelMetadata>> {
        let mut checkpoints = Vec::new();

        for entry in fs::read_dir(&self.run_dir)
            .with_context(|| format!("Failed to read run directory: {:?}", self.run_dir))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("safetensors") {
                continue;
            }
            match load_model_metadata(&path) {
                Ok(metadata) => checkpoints.push(metadata),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "Failed to load checkpoint metadata");
                }
            }
        }

        checkpoints.sort_by_key(|m| match m.tag {
            CheckpointTag::Epoch(epoch) => (0, epoch),
            CheckpointTag::Best => (1, 0),
        });
        Ok(checkpoints)
    }
}
