// Machine learning models
// Visual-question encoder plus one of three answer decoders, chosen once at startup

pub mod attn_rnn;
pub mod common;
pub mod encoder;
pub mod persistence;
pub mod rnn;
pub mod rnn_decoder;
pub mod tokenizer;
pub mod transformer;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

use crate::data::VqaBatch;

pub use attn_rnn::EncoderAttnRnn;
pub use common::{
    device_info, select_device, AttentionKind, AttentionMethod, DecoderKind, EncoderKind,
    ModelConfig, RnnKind,
};
pub use persistence::{
    checkpoint_path, load_model_metadata, model_exists, save_model_with_metadata, CheckpointTag,
    ModelMetadata,
};
pub use rnn_decoder::EncoderRnn;
pub use tokenizer::{SpecialTokens, TextCodec, TextTokenizer, WordCodec};
pub use transformer::EncoderTransformer;

/// Answer generator trained by the orchestrator
pub trait VqaModel: Send {
    fn kind(&self) -> DecoderKind;

    fn config(&self) -> &ModelConfig;

    /// Logits of shape (L, N, V) for a batch with L target positions
    ///
    /// `teacher_force_ratio` is the probability of feeding the gold token
    /// instead of the model's own prediction.
    fn forward(&self, batch: &VqaBatch, teacher_force_ratio: f64) -> Result<Tensor>;

    fn varmap(&self) -> &VarMap;

    fn varmap_mut(&mut self) -> &mut VarMap;

    fn trainable_vars(&self) -> Vec<Var> {
        self.varmap().all_vars()
    }

    /// Write weights and metadata to `<dir>/<tag>.safetensors` / `.json`
    fn save(&self, dir: &Path, tag: CheckpointTag) -> Result<PathBuf> {
        let path = checkpoint_path(dir, tag);
        let metadata = ModelMetadata::new(self.config().clone(), self.kind().to_string(), tag);
        save_model_with_metadata(&path, self.varmap(), &metadata)?;
        Ok(path)
    }
}

/// Construct the decoder family named in `config`
pub fn build_model(config: &ModelConfig, device: &Device) -> Result<Box<dyn VqaModel>> {
    config.validate()?;

    tracing::info!(
        decoder = %config.decoder,
        encoder = %config.encoder,
        rnn_type = %config.rnn_type,
        hidden_dim = config.hidden_dim,
        vocab_size = config.vocab_size,
        device = %device_info(device),
        "Building model"
    );

    let model: Box<dyn VqaModel> = match config.decoder {
        DecoderKind::Rnn => Box::new(EncoderRnn::new(config, device)?),
        DecoderKind::AttnRnn => Box::new(EncoderAttnRnn::new(config, device)?),
        DecoderKind::Transformer => Box::new(EncoderTransformer::new(config, device)?),
    };
    reseed_vars(model.varmap(), config.seed)?;
    Ok(model)
}

/// Redraw every randomly initialised variable from a generator seeded with `seed`
///
/// Each variable keeps the mean and spread of its initial values; constant
/// initialisations (zero biases, unit norms) are left alone. Candle cannot
/// seed its CPU generator, so this is what makes a run reproducible.
pub fn reseed_vars(varmap: &VarMap, seed: u64) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("model variables are poisoned"))?;
    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    let mut rng = StdRng::seed_from_u64(seed);
    for name in names {
        let var = &vars[name];
        let values = var.as_tensor().flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let count = values.len() as f32;
        let mean = values.iter().sum::<f32>() / count;
        let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / count).sqrt();
        if std == 0.0 || !std.is_finite() {
            continue;
        }

        // Uniform with the same spread
        let half_width = 3f32.sqrt() * std;
        let dist = Uniform::new_inclusive(mean - half_width, mean + half_width);
        let redrawn: Vec<f32> = (0..values.len()).map(|_| dist.sample(&mut rng)).collect();
        let tensor = Tensor::from_vec(redrawn, var.shape(), var.device())?.to_dtype(var.dtype())?;
        var.set(&tensor)
            .with_context(|| format!("Failed to reseed variable {}", name))?;
    }
    Ok(())
}

/// Rebuild a model from a saved checkpoint
pub fn load_checkpoint(dir: &Path, tag: CheckpointTag, device: &Device) -> Result<Box<dyn VqaModel>> {
    let path = checkpoint_path(dir, tag);
    let metadata = load_model_metadata(&path)?;
    let mut model = build_model(&metadata.config, device)?;
    model
        .varmap_mut()
        .load(&path)
        .with_context(|| format!("Failed to load model weights from {:?}", path))?;

    tracing::info!(path = %path.display(), tag = %tag, "Loaded checkpoint");
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use tempfile::TempDir;

    fn batch(device: &Device) -> VqaBatch {
        VqaBatch {
            input_ids: Tensor::new(&[[4u32, 5, 0], [6, 7, 8]], device).unwrap(),
            feats: Tensor::ones((2, 3, 6), DType::F32, device).unwrap(),
            boxes: Tensor::zeros((2, 3, 4), DType::F32, device).unwrap(),
            attention_mask: Tensor::new(&[[1u32, 1, 0], [1, 1, 1]], device).unwrap(),
            targets: Tensor::new(&[[9u32, 10], [11, 2], [2, 0]], device).unwrap(),
            target_mask: Tensor::new(&[[1u32, 1], [1, 1], [1, 0]], device).unwrap(),
        }
    }

    fn configs() -> Vec<ModelConfig> {
        let mut out = Vec::new();
        for decoder in [DecoderKind::Rnn, DecoderKind::AttnRnn, DecoderKind::Transformer] {
            let mut config = ModelConfig::small(12, 6);
            config.decoder = decoder;
            out.push(config.clone());
            if decoder == DecoderKind::AttnRnn {
                for method in [AttentionMethod::Dot, AttentionMethod::General, AttentionMethod::Concat] {
                    config.attn_type = AttentionKind::Luong;
                    config.attn_method = method;
                    config.rnn_type = RnnKind::Gru;
                    out.push(config.clone());
                }
            }
        }
        out
    }

    #[test]
    fn test_every_decoder_produces_sequence_first_logits() -> Result<()> {
        let device = Device::Cpu;
        let batch = batch(&device);
        for config in configs() {
            let model = build_model(&config, &device)?;
            for ratio in [0.0, 1.0] {
                let logits = model.forward(&batch, ratio)?;
                assert_eq!(logits.dims(), &[3, 2, 12], "{} ratio {}", config.decoder, ratio);
            }
        }
        Ok(())
    }

    #[test]
    fn test_single_step_target() -> Result<()> {
        let device = Device::Cpu;
        let mut batch = batch(&device);
        batch.targets = batch.targets.i(0..1)?;
        batch.target_mask = batch.target_mask.i(0..1)?;

        let mut config = ModelConfig::small(12, 6);
        config.decoder = DecoderKind::Transformer;
        let model = build_model(&config, &device)?;
        assert_eq!(model.forward(&batch, 1.0)?.dims(), &[1, 2, 12]);
        Ok(())
    }

    fn weights(model: &dyn VqaModel) -> Result<Vec<(String, Vec<f32>)>> {
        let vars = model.varmap().data().lock().unwrap();
        let mut out = Vec::new();
        for (name, var) in vars.iter() {
            out.push((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    #[test]
    fn test_same_seed_same_weights() -> Result<()> {
        let device = Device::Cpu;
        for config in configs() {
            let a = build_model(&config, &device)?;
            let b = build_model(&config, &device)?;
            assert_eq!(weights(a.as_ref())?, weights(b.as_ref())?, "{}", config.decoder);

            let mut reseeded = config.clone();
            reseeded.seed += 1;
            let c = build_model(&reseeded, &device)?;
            assert_ne!(weights(a.as_ref())?, weights(c.as_ref())?, "{}", config.decoder);
        }
        Ok(())
    }

    #[test]
    fn test_reseed_keeps_constant_init() -> Result<()> {
        let varmap = VarMap::new();
        let ones = varmap.get((4,), "norm.weight", candle_nn::Init::Const(1.0), DType::F32, &Device::Cpu)?;
        varmap.get((8, 4), "proj.weight", candle_nn::init::DEFAULT_KAIMING_NORMAL, DType::F32, &Device::Cpu)?;
        reseed_vars(&varmap, 3)?;
        assert_eq!(ones.to_vec1::<f32>()?, vec![1.0; 4]);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ModelConfig::small(12, 6);
        config.decoder = DecoderKind::Transformer;
        config.nheads = 5;
        assert!(build_model(&config, &Device::Cpu).is_err());
    }

    #[test]
    fn test_checkpoint_roundtrip() -> Result<()> {
        let tmp = TempDir::new()?;
        let device = Device::Cpu;
        let batch = batch(&device);

        let model = build_model(&ModelConfig::small(12, 6), &device)?;
        let path = model.save(tmp.path(), CheckpointTag::Best)?;
        assert!(model_exists(&path));

        let restored = load_checkpoint(tmp.path(), CheckpointTag::Best, &device)?;
        let a = model.forward(&batch, 1.0)?.flatten_all()?.to_vec1::<f32>()?;
        let b = restored.forward(&batch, 1.0)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
