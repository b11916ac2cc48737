// RNN answer decoder without attention
//
// The decoder state starts from the encoder summary and the summary is fed
// alongside every input token.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use super::common::{DecoderKind, ForcingCoin, ModelConfig};
use super::encoder::VisualQuestionEncoder;
use super::rnn::{top, StackedRnn};
use super::VqaModel;
use crate::data::VqaBatch;

pub struct EncoderRnn {
    config: ModelConfig,
    encoder: VisualQuestionEncoder,
    rnn: StackedRnn,
    out_proj: Linear,
    coin: ForcingCoin,
    varmap: VarMap,
}

impl EncoderRnn {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let h = config.hidden_dim;

        Ok(Self {
            config: config.clone(),
            encoder: VisualQuestionEncoder::new(config, vb.pp("encoder"))?,
            rnn: StackedRnn::new(config.rnn_type, 2 * h, h, config.num_rnn_layers, vb.pp("decoder"))?,
            out_proj: linear(h, config.vocab_size, vb.pp("out_proj"))?,
            coin: ForcingCoin::new(config.seed),
            varmap,
        })
    }
}

impl VqaModel for EncoderRnn {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Rnn
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
            let input = Tensor::cat(&[&embedded, &encoded.summary], D::Minus1)?;
            states = self.rnn.step(&input, &states)?;
            let step_logits = self.out_proj.forward(top(&states)?)?;

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
