// Attention RNN answer decoder (Bahdanau or Luong)

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder, VarMap};

use super::common::{AttentionKind, AttentionMethod, DecoderKind, ForcingCoin, ModelConfig};
use super::encoder::{mask_bias, Encoded, VisualQuestionEncoder};
use super::rnn::{top, StackedRnn};
use super::VqaModel;
use crate::data::VqaBatch;

/// Scores a (N, H) query against a (N, S, H) memory
enum Scorer {
    Dot,
    General(Linear),
    Concat {
        w_query: Linear,
        w_memory: Linear,
        v: Linear,
    },
}

impl Scorer {
    fn new(method: AttentionMethod, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(match method {
            AttentionMethod::Dot => Scorer::Dot,
            AttentionMethod::General => {
                Scorer::General(linear_no_bias(hidden_dim, hidden_dim, vb.pp("w"))?)
            }
            AttentionMethod::Concat => Scorer::Concat {
                w_query: linear(hidden_dim, hidden_dim, vb.pp("w_query"))?,
                w_memory: linear_no_bias(hidden_dim, hidden_dim, vb.pp("w_memory"))?,
                v: linear_no_bias(hidden_dim, 1, vb.pp("v"))?,
            },
        })
    }

    /// Raw scores, (N, S)
    fn score(&self, query: &Tensor, memory: &Tensor) -> Result<Tensor> {
        let scores = match self {
            Scorer::Dot => memory.matmul(&query.unsqueeze(2)?)?,
            Scorer::General(w) => memory.matmul(&w.forward(query)?.unsqueeze(2)?)?,
            Scorer::Concat { w_query, w_memory, v } => {
                let keys = w_memory.forward(memory)?;
                let q = w_query.forward(query)?.unsqueeze(1)?;
                v.forward(&keys.broadcast_add(&q)?.tanh()?)?
            }
        };
        Ok(scores.squeeze(2)?)
    }

    /// Attention-weighted sum of the memory, (N, H)
    fn context(&self, query: &Tensor, encoded: &Encoded) -> Result<Tensor> {
        let scores = (self.score(query, &encoded.memory)? + mask_bias(&encoded.memory_mask)?)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        Ok(weights.unsqueeze(1)?.matmul(&encoded.memory)?.squeeze(1)?)
    }
}

pub struct EncoderAttnRnn {
    config: ModelConfig,
    encoder: VisualQuestionEncoder,
    rnn: StackedRnn,
    scorer: Scorer,
    /// Luong only: combines hidden state and context
    combine: Option<Linear>,
    out_proj: Linear,
    coin: ForcingCoin,
    varmap: VarMap,
}

impl EncoderAttnRnn {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let h = config.hidden_dim;

        // Bahdanau is additive attention over the previous state
        let (method, rnn_input, combine, out_in) = match config.attn_type {
            AttentionKind::Bahdanau => (AttentionMethod::Concat, 2 * h, None, 2 * h),
            AttentionKind::Luong => (
                config.attn_method,
                h,
                Some(linear(2 * h, h, vb.pp("combine"))?),
                h,
            ),
        };

        Ok(Self {
            config: config.clone(),
            encoder: VisualQuestionEncoder::new(config, vb.pp("encoder"))?,
            rnn: StackedRnn::new(config.rnn_type, rnn_input, h, config.num_rnn_layers, vb.pp("decoder"))?,
            scorer: Scorer::new(method, h, vb.pp("attention"))?,
            combine,
            out_proj: linear(out_in, config.vocab_size, vb.pp("out_proj"))?,
            coin: ForcingCoin::new(config.seed),
            varmap,
        })
    }
}

impl VqaModel for EncoderAttnRnn {
    fn kind(&self) -> DecoderKind {
        DecoderKind::AttnRnn
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn forward(&self, batch: &VqaBatch, teacher_force_ratio: f64) -> Result<Tensor> {
        let encoded = self.encoder.encode(batch)?;
        let n = batch.batch_size();
        let device = batch.targets.device();

        let mut states = self.rnn.state_from(&encoded.summary)?;
        let mut token = Tensor::full(self.config.bos_id, n, device)?;
        let mut logits = Vec::with_capacity(batch.target_len());

        for t in 0..batch.target_len() {
            let embedded = self.encoder.embed(&token)?;

            let step_logits = match &self.combine {
                None => {
                    let context = self.scorer.context(top(&states)?, &encoded)?;
                    let input = Tensor::cat(&[&embedded, &context], D::Minus1)?;
                    states = self.rnn.step(&input, &states)?;
                    let out = Tensor::cat(&[top(&states)?, &context], D::Minus1)?;
                    self.out_proj.forward(&out)?
                }
                Some(combine) => {
                    states = self.rnn.step(&embedded, &states)?;
                    let hidden = top(&states)?;
                    let context = self.scorer.context(hidden, &encoded)?;
                    let attended = combine
                        .forward(&Tensor::cat(&[hidden, &context], D::Minus1)?)?
                        .tanh()?;
                    self.out_proj.forward(&attended)?
                }
            };

            token = if self.coin.flip(teacher_force_ratio) {
                batch.targets.i(t)?
            } else {
                step_logits.argmax(D::Minus1)?
            };
            logits.push(step_logits);
        }

        Ok(Tensor::stack(&logits, 0)?)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }
}
