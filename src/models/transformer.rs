// Transformer answer decoder
//
// Causal self-attention over the answer prefix plus cross-attention over the
// encoder memory. With teacher forcing the whole target is decoded in one
// parallel pass; otherwise tokens are generated greedily one at a time.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder, VarMap};

use super::common::{DecoderKind, ForcingCoin, ModelConfig};
use super::encoder::{mask_bias, Encoded, VisualQuestionEncoder};
use super::VqaModel;
use crate::data::VqaBatch;
use crate::errors::VqaError;

pub struct EncoderTransformer {
    config: ModelConfig,
    encoder: VisualQuestionEncoder,
    positions: Embedding,
    layers: Vec<DecoderLayer>,
    out_proj: Linear,
    coin: ForcingCoin,
    varmap: VarMap,
}

impl EncoderTransformer {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut layers = Vec::with_capacity(config.num_transformer_layers);
        for i in 0..config.num_transformer_layers {
            layers.push(DecoderLayer::new(config, vb.pp(format!("layer_{}", i)))?);
        }

        Ok(Self {
            config: config.clone(),
            encoder: VisualQuestionEncoder::new(config, vb.pp("encoder"))?,
            positions: embedding(config.max_answer_len, config.hidden_dim, vb.pp("positions"))?,
            layers,
            out_proj: linear(config.hidden_dim, config.vocab_size, vb.pp("out_proj"))?,
            coin: ForcingCoin::new(config.seed),
            varmap,
        })
    }

    /// Logits (N, L, V) for every position of `tokens` (N, L)
    fn decode(&self, tokens: &Tensor, encoded: &Encoded) -> Result<Tensor> {
        let (_, len) = tokens.dims2()?;
        let device = tokens.device();

        let pos_ids = Tensor::arange(0u32, len as u32, device)?;
        let mut hidden = self
            .encoder
            .embed(tokens)?
            .broadcast_add(&self.positions.forward(&pos_ids)?)?;

        let causal = create_causal_mask(len, device)?;
        let memory_bias = mask_bias(&encoded.memory_mask)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &causal, &encoded.memory, &memory_bias)?;
        }

        Ok(self.out_proj.forward(&hidden)?)
    }

    /// Decoder input: bos followed by the targets shifted right, (N, L)
    fn shifted_targets(&self, batch: &VqaBatch) -> Result<Tensor> {
        let targets = batch.targets.t()?.contiguous()?;
        let len = batch.target_len();
        let bos = Tensor::full(self.config.bos_id, (batch.batch_size(), 1), targets.device())?;
        if len == 1 {
            return Ok(bos);
        }
        Ok(Tensor::cat(&[&bos, &targets.i((.., ..len - 1))?], 1)?)
    }
}

impl VqaModel for EncoderTransformer {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Transformer
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(&self, batch: &VqaBatch, teacher_force_ratio: f64) -> Result<Tensor> {
        let len = batch.target_len();
        if len > self.config.max_answer_len {
            return Err(VqaError::invalid(format!(
                "target length {} exceeds max_answer_len {}",
                len, self.config.max_answer_len
            ))
            .into());
        }

        let encoded = self.encoder.encode(batch)?;

        // One draw per call
        let logits = if self.coin.flip(teacher_force_ratio) {
            self.decode(&self.shifted_targets(batch)?, &encoded)?
        } else {
            let n = batch.batch_size();
            let mut tokens = Tensor::full(self.config.bos_id, (n, 1), batch.targets.device())?;
            let mut steps = Vec::with_capacity(len);
            for t in 0..len {
                let logits = self.decode(&tokens, &encoded)?;
                let last = logits.i((.., t, ..))?.contiguous()?;
                if t + 1 < len {
                    let next = last.argmax_keepdim(D::Minus1)?;
                    tokens = Tensor::cat(&[&tokens, &next], 1)?;
                }
                steps.push(last);
            }
            Tensor::stack(&steps, 1)?
        };

        // Sequence-first like the RNN decoders
        Ok(logits.transpose(0, 1)?.contiguous()?)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}

/// Post-norm decoder layer
struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl DecoderLayer {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(config, vb.pp("cross_attn"))?,
            feed_forward: FeedForward::new(config, vb.pp("ffn"))?,
            norm1: layer_norm(config.hidden_dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(config.hidden_dim, 1e-5, vb.pp("norm2"))?,
            norm3: layer_norm(config.hidden_dim, 1e-5, vb.pp("norm3"))?,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        causal: &Tensor,
        memory: &Tensor,
        memory_bias: &Tensor,
    ) -> Result<Tensor> {
        // Self-attention with residual
        let attn_out = self.self_attn.forward(x, x, causal)?;
        let x = self.norm1.forward(&(x + attn_out)?)?;

        // Cross-attention over question tokens and image regions
        let bias = memory_bias.unsqueeze(1)?.unsqueeze(1)?;
        let cross_out = self.cross_attn.forward(&x, memory, &bias)?;
        let x = self.norm2.forward(&(&x + cross_out)?)?;

        // Feed-forward with residual
        let ffn_out = self.feed_forward.forward(&x)?;
        Ok(self.norm3.forward(&(&x + ffn_out)?)?)
    }
}

struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiHeadAttention {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.hidden_dim / config.nheads;
        Ok(Self {
            q_proj: linear(config.hidden_dim, config.hidden_dim, vb.pp("q"))?,
            k_proj: linear(config.hidden_dim, config.hidden_dim, vb.pp("k"))?,
            v_proj: linear(config.hidden_dim, config.hidden_dim, vb.pp("v"))?,
            o_proj: linear(config.hidden_dim, config.hidden_dim, vb.pp("o"))?,
            num_heads: config.nheads,
            head_dim,
        })
    }

    /// (N, L, H) -> (N, heads, L, head_dim)
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (n, len, _) = x.dims3()?;
        Ok(x.reshape((n, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `bias` broadcasts against (N, heads, Lq, Lk)
    fn forward(&self, query: &Tensor, kv: &Tensor, bias: &Tensor) -> Result<Tensor> {
        let (n, len, hidden) = query.dims3()?;
        let q = self.split_heads(&self.q_proj.forward(query)?)?;
        let k = self.split_heads(&self.k_proj.forward(kv)?)?;
        let v = self.split_heads(&self.v_proj.forward(kv)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?.broadcast_add(bias)?;
        let attn_weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let attn_out = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((n, len, hidden))?;
        Ok(self.o_proj.forward(&attn_out)?)
    }
}

struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_dim * 4;
        Ok(Self {
            linear1: linear(config.hidden_dim, hidden, vb.pp("fc1"))?,
            linear2: linear(hidden, config.hidden_dim, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.linear1.forward(x)?;
        let x = gelu(&x)?;
        Ok(self.linear2.forward(&x)?)
    }
}

/// Causal mask for autoregressive decoding, (L, L)
fn create_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask_data, (seq_len, seq_len), device)?)
}

/// GELU approximation: x * sigmoid(1.702 * x)
fn gelu(x: &Tensor) -> Result<Tensor> {
    let sig = candle_nn::ops::sigmoid(&(x * 1.702)?)?;
    Ok((x * sig)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_causal_mask() -> Result<()> {
        let mask = create_causal_mask(3, &Device::Cpu)?.to_vec2::<f32>()?;
        assert_eq!(mask[0][0], 0.0);
        assert!(mask[0][1].is_infinite());
        assert_eq!(mask[2][1], 0.0);
        Ok(())
    }
}
