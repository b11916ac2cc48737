// Model persistence utilities
// Handles saving/loading weights + configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::common::ModelConfig;

/// Which checkpoint slot a save goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTag {
    /// Best log-point training accuracy so far
    Best,
    /// Unconditional save at the end of this epoch
    Epoch(usize),
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointTag::Best => f.write_str("BEST"),
            CheckpointTag::Epoch(epoch) => write!(f, "{}", epoch),
        }
    }
}

/// Metadata saved alongside model weights
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model configuration
    pub config: ModelConfig,
    /// Model type identifier
    pub model_type: String,
    /// Checkpoint slot
    pub tag: CheckpointTag,
    /// Timestamp of save
    pub timestamp: String,
    /// Version of the persistence format
    pub format_version: u32,
}

impl ModelMetadata {
    pub fn new(config: ModelConfig, model_type: String, tag: CheckpointTag) -> Self {
        Self {
            config,
            model_type,
            tag,
            timestamp: chrono::Utc::now().to_rfc3339(),
            format_version: 1,
        }
    }
}

/// `<dir>/<tag>.safetensors`
pub fn checkpoint_path(dir: &Path, tag: CheckpointTag) -> PathBuf {
    dir.join(format!("{}.safetensors", tag))
}

/// Save model with metadata
///
/// Creates two files:
/// - {path}.safetensors - Model weights (Candle's VarMap format)
/// - {path}.json - Model metadata (config, type, tag)
pub fn save_model_with_metadata(
    weights_path: &Path,
    varmap: &candle_nn::VarMap,
    metadata: &ModelMetadata,
) -> Result<()> {
    if let Some(parent) = weights_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", parent))?;
    }

    // Save weights
    varmap
        .save(weights_path)
        .with_context(|| format!("Failed to save model weights to {:?}", weights_path))?;

    // Save metadata
    let metadata_path = weights_path.with_extension("json");
    let metadata_json = serde_json::to_string_pretty(metadata)
        .context("Failed to serialize model metadata")?;
    fs::write(&metadata_path, metadata_json)
        .with_context(|| format!("Failed to write metadata to {:?}", metadata_path))?;

    tracing::info!(
        model_type = %metadata.model_type,
        tag = %metadata.tag,
        path = %weights_path.display(),
        "Saved model checkpoint"
    );

    Ok(())
}

/// Load model metadata
pub fn load_model_metadata(weights_path: &Path) -> Result<ModelMetadata> {
    let metadata_path = weights_path.with_extension("json");

    if !metadata_path.exists() {
        anyhow::bail!("Model metadata not found at {:?}", metadata_path);
    }

    let metadata_json = fs::read_to_string(&metadata_path)
        .with_context(|| format!("Failed to read metadata from {:?}", metadata_path))?;

    let metadata: ModelMetadata = serde_json::from_str(&metadata_json)
        .context("Failed to parse model metadata JSON")?;

    Ok(metadata)
}

/// Check if a saved model exists
pub fn model_exists(weights_path: &Path) -> bool {
    let metadata_path = weights_path.with_extension("json");
    weights_path.exists() && metadata_path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_serialization() {
        let config = ModelConfig::small(12, 4);
        let metadata = ModelMetadata::new(config.clone(), "rnn".to_string(), CheckpointTag::Epoch(4));

        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: ModelMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(metadata.model_type, deserialized.model_type);
        assert_eq!(deserialized.tag, CheckpointTag::Epoch(4));
        assert_eq!(deserialized.config, config);
        assert_eq!(metadata.format_version, deserialized.format_version);
    }

    #[test]
    fn test_checkpoint_paths_use_tag() {
        let dir = Path::new("/runs/42");
        assert_eq!(
            checkpoint_path(dir, CheckpointTag::Best),
            PathBuf::from("/runs/42/BEST.safetensors")
        );
        assert_eq!(
            checkpoint_path(dir, CheckpointTag::Epoch(9)),
            PathBuf::from("/runs/42/9.safetensors")
        );
    }

    #[test]
    fn test_model_exists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("BEST.safetensors");

        // Should not exist initially
        assert!(!model_exists(&path));

        // Create the files
        fs::write(&path, "weights").unwrap();
        fs::write(path.with_extension("json"), "metadata").unwrap();

        // Should exist now
        assert!(model_exists(&path));
    }
}
