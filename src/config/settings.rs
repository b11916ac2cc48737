// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// LXMERT hidden size, kept as the default model width
pub const DEFAULT_HIDDEN_SIZE: usize = 768;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingSettings,
    pub model: ModelSettings,
    pub data: DataSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Validate and log every N epochs
    pub log_every: usize,
    /// Unconditional checkpoint every N epochs
    pub save_every: usize,
    pub use_cuda: bool,
    pub show_progress: bool,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 200,
            learning_rate: 0.005,
            log_every: 1,
            save_every: 50,
            use_cuda: true,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub hidden_dim: usize,
    /// Decoder length cap, end token included
    pub max_answer_len: usize,
    /// Width of one region feature vector
    pub feature_dim: usize,
    pub tokenizer_path: PathBuf,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            hidden_dim: DEFAULT_HIDDEN_SIZE,
            max_answer_len: 20,
            feature_dim: 2048,
            tokenizer_path: PathBuf::from("tokenizer.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    pub train_cache_dir: PathBuf,
    pub val_cache_dir: PathBuf,
    pub train_image_dir: PathBuf,
    pub val_image_dir: PathBuf,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            train_cache_dir: PathBuf::from("../fsvqa_data_train_full"),
            val_cache_dir: PathBuf::from("../fsvqa_data_val_full"),
            train_image_dir: PathBuf::from("../img_data"),
            val_image_dir: PathBuf::from("../val_img_data"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Run directories (one per run id) are created under here
    pub checkpoints_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            checkpoints_dir: PathBuf::from("checkpoints"),
            logs_dir: PathBuf::from("logs"),
        }
    }
}
