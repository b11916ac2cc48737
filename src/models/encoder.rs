// Visual-question encoder shared by every decoder family
//
// Questions are embedded (and optionally run through an RNN), image regions
// are projected into the same hidden space, and both are concatenated into one
// memory the decoders attend over.

use anyhow::Result;
use candle_core::{DType, Module, Tensor, D};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};

use super::common::{EncoderKind, ModelConfig};
use super::rnn::StackedRnn;
use crate::data::dataset::BOX_DIM;
use crate::data::VqaBatch;

/// Encoder output
pub struct Encoded {
    /// (N, Lq + B, H)
    pub memory: Tensor,
    /// (N, Lq + B) f32, 1 for real positions
    pub memory_mask: Tensor,
    /// (N, H) masked mean of the memory
    pub summary: Tensor,
}

pub struct VisualQuestionEncoder {
    embedding: Embedding,
    forward_rnn: Option<StackedRnn>,
    backward_rnn: Option<StackedRnn>,
    visual_proj: Linear,
    box_proj: Linear,
}

impl VisualQuestionEncoder {
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let embedding = embedding(config.vocab_size, h, vb.pp("embedding"))?;

        let (forward_rnn, backward_rnn) = match config.encoder {
            EncoderKind::Bag => (None, None),
            EncoderKind::Rnn => {
                let fwd = StackedRnn::new(config.rnn_type, h, h, config.num_rnn_layers, vb.pp("q_rnn_fwd"))?;
                let bwd = if config.bidirectional {
                    Some(StackedRnn::new(
                        config.rnn_type,
                        h,
                        h,
                        config.num_rnn_layers,
                        vb.pp("q_rnn_bwd"),
                    )?)
                } else {
                    None
                };
                (Some(fwd), bwd)
            }
        };

        Ok(Self {
            embedding,
            forward_rnn,
            backward_rnn,
            visual_proj: linear(config.feature_dim, h, vb.pp("visual_proj"))?,
            box_proj: linear(BOX_DIM, h, vb.pp("box_proj"))?,
        })
    }

    /// Token embeddings, shared with the decoders
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.embedding.forward(ids)?)
    }

    pub fn encode(&self, batch: &VqaBatch) -> Result<Encoded> {
        let embedded = self.embed(&batch.input_ids)?;

        let question = match &self.forward_rnn {
            None => embedded,
            Some(fwd) => {
                let mask = &batch.attention_mask;
                let (out, _) = fwd.run(&embedded, Some(mask), false)?;
                match &self.backward_rnn {
                    // Directions are summed to stay at H
                    Some(bwd) => (out + bwd.run(&embedded, Some(mask), true)?.0)?,
                    None => out,
                }
            }
        };

        let visual = (self.visual_proj.forward(&batch.feats)? + self.box_proj.forward(&batch.boxes)?)?
            .relu()?;

        let memory = Tensor::cat(&[&question, &visual], 1)?;

        let (n, num_boxes, _) = batch.feats.dims3()?;
        let question_mask = batch.attention_mask.to_dtype(DType::F32)?;
        let visual_mask = Tensor::ones((n, num_boxes), DType::F32, batch.feats.device())?;
        let memory_mask = Tensor::cat(&[&question_mask, &visual_mask], 1)?;

        let summary = masked_mean(&memory, &memory_mask)?;

        Ok(Encoded {
            memory,
            memory_mask,
            summary,
        })
    }
}

/// Mean over positions where `mask` (N, S) is 1; memory is (N, S, H)
pub fn masked_mean(memory: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let weights = mask.unsqueeze(D::Minus1)?;
    let total = memory.broadcast_mul(&weights)?.sum(1)?;
    let count = mask.sum_keepdim(1)?.maximum(1.0)?;
    Ok(total.broadcast_div(&count)?)
}

/// Additive attention bias: 0 where `mask` is 1, -1e9 where it is 0
pub fn mask_bias(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.affine(1e9, -1e9)?)
}
