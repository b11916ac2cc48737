// Stacked LSTM/GRU built from candle's single-layer cells

use anyhow::Result;
use candle_core::{IndexOp, Tensor};
use candle_nn::rnn::{gru, lstm, GRUConfig, GRUState, LSTMConfig, LSTMState, GRU, LSTM, RNN};
use candle_nn::VarBuilder;

use super::common::RnnKind;

enum Cell {
    Lstm(LSTM),
    Gru(GRU),
}

/// Per-layer recurrent state
#[derive(Debug, Clone)]
pub enum CellState {
    Lstm(LSTMState),
    Gru(GRUState),
}

impl CellState {
    /// Hidden output of this layer, (N, H)
    pub fn h(&self) -> &Tensor {
        match self {
            CellState::Lstm(state) => &state.h,
            CellState::Gru(state) => &state.h,
        }
    }

    /// `self` where `keep` (N, 1) is 1, `prev` where it is 0
    fn select(&self, prev: &CellState, keep: &Tensor) -> Result<CellState> {
        let mix = |new: &Tensor, old: &Tensor| -> Result<Tensor> {
            let hold = keep.affine(-1.0, 1.0)?;
            Ok((new.broadcast_mul(keep)? + old.broadcast_mul(&hold)?)?)
        };
        Ok(match (self, prev) {
            (CellState::Lstm(new), CellState::Lstm(old)) => CellState::Lstm(LSTMState {
                h: mix(&new.h, &old.h)?,
                c: mix(&new.c, &old.c)?,
            }),
            (CellState::Gru(new), CellState::Gru(old)) => CellState::Gru(GRUState {
                h: mix(&new.h, &old.h)?,
            }),
            _ => anyhow::bail!("cannot mix LSTM and GRU states"),
        })
    }
}

pub struct StackedRnn {
    layers: Vec<Cell>,
    kind: RnnKind,
}

impl StackedRnn {
    pub fn new(
        kind: RnnKind,
        input_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let vb = vb.pp(format!("layer_{}", i));
            let cell = match kind {
                RnnKind::Lstm => Cell::Lstm(lstm(in_dim, hidden_dim, LSTMConfig::default(), vb)?),
                RnnKind::Gru => Cell::Gru(gru(in_dim, hidden_dim, GRUConfig::default(), vb)?),
            };
            layers.push(cell);
        }
        Ok(Self { layers, kind })
    }

    pub fn zero_state(&self, batch: usize) -> Result<Vec<CellState>> {
        self.layers
            .iter()
            .map(|cell| {
                Ok(match cell {
                    Cell::Lstm(l) => CellState::Lstm(l.zero_state(batch)?),
                    Cell::Gru(g) => CellState::Gru(g.zero_state(batch)?),
                })
            })
            .collect()
    }

    /// Every layer starts from `h0` (N, H); LSTM cells get a zero cell state
    pub fn state_from(&self, h0: &Tensor) -> Result<Vec<CellState>> {
        let c0 = h0.zeros_like()?;
        Ok(self
            .layers
            .iter()
            .map(|_| match self.kind {
                RnnKind::Lstm => CellState::Lstm(LSTMState {
                    h: h0.clone(),
                    c: c0.clone(),
                }),
                RnnKind::Gru => CellState::Gru(GRUState { h: h0.clone() }),
            })
            .collect())
    }

    /// One timestep through every layer; input is (N, D)
    pub fn step(&self, input: &Tensor, states: &[CellState]) -> Result<Vec<CellState>> {
        let mut next = Vec::with_capacity(self.layers.len());
        let mut x = input.clone();
        for (cell, state) in self.layers.iter().zip(states) {
            let new_state = match (cell, state) {
                (Cell::Lstm(l), CellState::Lstm(s)) => CellState::Lstm(l.step(&x, s)?),
                (Cell::Gru(g), CellState::Gru(s)) => CellState::Gru(g.step(&x, s)?),
                _ => anyhow::bail!("RNN state does not match the {} cell", self.kind),
            };
            x = new_state.h().clone();
            next.push(new_state);
        }
        Ok(next)
    }

    /// Run over a (N, L, D) sequence; outputs are (N, L, H) in input order
    ///
    /// With `mask` (N, L), padded positions carry the previous state through
    /// unchanged, so a reversed run over right-padded input starts at each
    /// sample's last real token.
    pub fn run(
        &self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        reverse: bool,
    ) -> Result<(Tensor, Vec<CellState>)> {
        let (batch, seq_len, _) = xs.dims3()?;
        let mask = mask.map(|m| m.to_dtype(xs.dtype())).transpose()?;
        let mut states = self.zero_state(batch)?;
        let mut outputs = Vec::with_capacity(seq_len);

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..seq_len).rev())
        } else {
            Box::new(0..seq_len)
        };
        for t in order {
            let x = xs.i((.., t, ..))?.contiguous()?;
            let stepped = self.step(&x, &states)?;
            states = match &mask {
                Some(mask) => {
                    let keep = mask.i((.., t..t + 1))?.contiguous()?;
                    stepped
                        .iter()
                        .zip(&states)
                        .map(|(new, old)| new.select(old, &keep))
                        .collect::<Result<Vec<_>>>()?
                }
                None => stepped,
            };
            outputs.push(top(&states)?.clone());
        }
        if reverse {
            outputs.reverse();
        }

        Ok((Tensor::stack(&outputs, 1)?, states))
    }
}

/// Output of the last layer
pub fn top(states: &[CellState]) -> Result<&Tensor> {
    states
        .last()
        .map(CellState::h)
        .ok_or_else(|| anyhow::anyhow!("RNN has no layers"))
}
