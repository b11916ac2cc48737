// Common model utilities and types

use anyhow::Result;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use crate::errors::VqaError;

/// Decoder family, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    Rnn,
    AttnRnn,
    Transformer,
}

/// Question encoder in front of the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncoderKind {
    /// Embeddings run through a (bi)directional RNN
    Rnn,
    /// Plain token embeddings
    Bag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RnnKind {
    Lstm,
    Gru,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionKind {
    Bahdanau,
    Luong,
}

/// Luong scoring function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionMethod {
    Dot,
    General,
    Concat,
}

macro_rules! selector {
    ($ty:ident, $what:literal, { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = VqaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    other => Err(VqaError::invalid(format!(
                        "unknown {} `{}` (expected one of: {})",
                        $what,
                        other,
                        [$($name),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($ty::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

selector!(DecoderKind, "decoder type", {
    "rnn" => Rnn,
    "attn-rnn" => AttnRnn,
    "transformer" => Transformer,
});
selector!(EncoderKind, "encoder type", { "rnn" => Rnn, "bag" => Bag });
selector!(RnnKind, "rnn type", { "lstm" => Lstm, "gru" => Gru });
selector!(AttentionKind, "attention type", { "bahdanau" => Bahdanau, "luong" => Luong });
selector!(AttentionMethod, "attention method", {
    "dot" => Dot,
    "general" => General,
    "concat" => Concat,
});

/// Everything needed to rebuild a model from a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub feature_dim: usize,
    /// Longest target sequence the Transformer can position-encode
    pub max_answer_len: usize,
    pub pad_id: u32,
    pub bos_id: u32,
    pub eos_id: u32,
    pub encoder: EncoderKind,
    pub decoder: DecoderKind,
    pub rnn_type: RnnKind,
    pub num_rnn_layers: usize,
    /// Applies to the question RNN
    pub bidirectional: bool,
    pub attn_type: AttentionKind,
    pub attn_method: AttentionMethod,
    pub nheads: usize,
    pub num_transformer_layers: usize,
    /// Seeds the teacher-forcing coin
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30_522,
            hidden_dim: crate::config::DEFAULT_HIDDEN_SIZE,
            feature_dim: 2048,
            max_answer_len: 20,
            pad_id: 0,
            bos_id: 101,
            eos_id: 102,
            encoder: EncoderKind::Rnn,
            decoder: DecoderKind::Rnn,
            rnn_type: RnnKind::Lstm,
            num_rnn_layers: 1,
            bidirectional: false,
            attn_type: AttentionKind::Bahdanau,
            attn_method: AttentionMethod::Dot,
            nheads: 12,
            num_transformer_layers: 6,
            seed: 8956,
        }
    }
}

impl ModelConfig {
    /// Small config for fast testing (works well on CPU)
    pub fn small(vocab_size: usize, feature_dim: usize) -> Self {
        Self {
            vocab_size,
            hidden_dim: 16,
            feature_dim,
            max_answer_len: 8,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
            nheads: 2,
            num_transformer_layers: 1,
            seed: 7,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), VqaError> {
        if self.vocab_size == 0 || self.hidden_dim == 0 || self.feature_dim == 0 {
            return Err(VqaError::invalid(
                "vocab_size, hidden_dim and feature_dim must be positive",
            ));
        }
        if self.num_rnn_layers == 0 {
            return Err(VqaError::invalid("num_rnn_layers must be positive"));
        }
        if self.decoder == DecoderKind::Transformer {
            if self.nheads == 0 || self.hidden_dim % self.nheads != 0 {
                return Err(VqaError::invalid(format!(
                    "hidden_dim {} is not divisible by nheads {}",
                    self.hidden_dim, self.nheads
                )));
            }
            if self.num_transformer_layers == 0 {
                return Err(VqaError::invalid("num_transformer_layers must be positive"));
            }
        }
        Ok(())
    }
}

/// Pick the training device once
///
/// CUDA is used when requested and available; otherwise CPU.
pub fn select_device(use_cuda: bool) -> Device {
    if !use_cuda {
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device 0)");
            device
        }
        Ok(device) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            device
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

pub fn device_info(device: &Device) -> String {
    match device {
        Device::Cpu => "CPU".to_string(),
        Device::Cuda(_) => "CUDA".to_string(),
        Device::Metal(_) => "Metal".to_string(),
    }
}

/// Seeded Bernoulli draws for teacher forcing
pub struct ForcingCoin {
    rng: Mutex<StdRng>,
}

impl ForcingCoin {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// True with probability `ratio`; 0 never forces, 1 always does
    pub fn flip(&self, ratio: f64) -> bool {
        if ratio <= 0.0 {
            return false;
        }
        if ratio >= 1.0 {
            return true;
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        rng.gen_bool(ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_parse_case_insensitively() {
        assert_eq!("ATTN-RNN".parse::<DecoderKind>().unwrap(), DecoderKind::AttnRnn);
        assert_eq!("Transformer".parse::<DecoderKind>().unwrap(), DecoderKind::Transformer);
        assert_eq!("gru".parse::<RnnKind>().unwrap(), RnnKind::Gru);
        assert_eq!("luong".parse::<AttentionKind>().unwrap(), AttentionKind::Luong);
        assert_eq!("concat".parse::<AttentionMethod>().unwrap(), AttentionMethod::Concat);
        assert_eq!(DecoderKind::AttnRnn.to_string(), "attn-rnn");
    }

    #[test]
    fn test_unknown_selector_is_invalid_argument() {
        let err = "lxmert".parse::<EncoderKind>().unwrap_err();
        assert!(matches!(err, VqaError::InvalidArgument(_)));
        assert!(err.to_string().contains("rnn, bag"));
    }

    #[test]
    fn test_transformer_heads_must_divide_hidden() {
        let mut config = ModelConfig::small(10, 4);
        config.decoder = DecoderKind::Transformer;
        config.nheads = 3;
        assert!(config.validate().is_err());
        config.nheads = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_forcing_coin_extremes() {
        let coin = ForcingCoin::new(1);
        assert!((0..100).all(|_| !coin.flip(0.0)));
        assert!((0..100).all(|_| coin.flip(1.0)));
    }
}
