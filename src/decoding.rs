// Greedy decoding of model outputs back to answer text

use anyhow::Result;
use candle_core::{Tensor, D};
use std::sync::Arc;

use crate::models::TextCodec;

pub struct GreedyDecoder {
    codec: Arc<dyn TextCodec>,
}

impl GreedyDecoder {
    pub fn new(codec: Arc<dyn TextCodec>) -> Self {
        Self { codec }
    }

    /// Argmax ids per sample from (L, N, V) logits, as N rows of length L
    pub fn predicted_ids(logits: &Tensor) -> Result<Vec<Vec<u32>>> {
        let ids = logits.argmax(D::Minus1)?.t()?.contiguous()?;
        Ok(ids.to_vec2::<u32>()?)
    }

    /// N answer strings from (L, N, V) logits
    pub fn decode_from_logits(&self, logits: &Tensor) -> Result<Vec<String>> {
        Self::predicted_ids(logits)?
            .iter()
            .map(|ids| self.decode_ids(ids))
            .collect()
    }

    /// N answer strings from (L, N) target ids
    pub fn batch_decode(&self, targets: &Tensor) -> Result<Vec<String>> {
        targets
            .t()?
            .contiguous()?
            .to_vec2::<u32>()?
            .iter()
            .map(|ids| self.decode_ids(ids))
            .collect()
    }

    /// Cut at the first end id, drop pad/bos, detokenize
    pub fn decode_ids(&self, ids: &[u32]) -> Result<String> {
        let special = self.codec.special_tokens();
        let kept: Vec<u32> = ids
            .iter()
            .copied()
            .take_while(|&id| id != special.eos)
            .filter(|&id| id != special.pad && id != special.bos)
            .collect();
        self.codec.decode(&kept)
    }
}
