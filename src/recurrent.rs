use candle_core::{Device, IndexOp, Result, Tensor};
use candle_nn::rnn::{lstm, LSTMConfig, LSTMState, LSTM};
use candle_nn::{Dropout, Init, VarBuilder, RNN};

/// Per-layer LSTM state, bottom layer first.
pub type StackState = Vec<LSTMState>;

/// `num_layers` LSTM cells stacked so that layer k's output is layer
/// k+1's input. Each cell's output goes through dropout before it is
/// passed on. Weights are created once and shared by every time step.
pub struct StackedLstm {
    layers: Vec<LSTM>,
    dropout: Dropout,
    swap_memory: bool,
}

impl StackedLstm {
    pub fn new(
        hidden_size: usize,
        num_layers: usize,
        drop_p: f32,
        init: Init,
        swap_memory: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let config = LSTMConfig {
            w_ih_init: init,
            w_hh_init: init,
            b_ih_init: Some(init),
            b_hh_init: Some(init),
            ..Default::default()
        };
        let layers = (0..num_layers)
            .map(|i| lstm(hidden_size, hidden_size, config, vb.pp(format!("layer_{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            dropout: Dropout::new(drop_p),
            swap_memory,
        })
    }

    pub fn zero_state(&self, batch_size: usize) -> Result<StackState> {
        self.layers
            .iter()
            .map(|layer| layer.zero_state(batch_size))
            .collect()
    }

    /// One time step through every layer. `xs` is `(batch, hidden_size)`;
    /// returns the top layer's output and the new per-layer state.
    pub fn step(&self, xs: &Tensor, state: &[LSTMState], train: bool) -> Result<(Tensor, StackState)> {
        let mut input = xs.clone();
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, prev) in self.layers.iter().zip(state) {
            let s = layer.step(&input, prev)?;
            input = self.dropout.forward(s.h(), train)?;
            next.push(s);
        }
        Ok((input, next))
    }

    /// Runs the stack over `(batch, seq_len, hidden_size)` inputs.
    ///
    /// With `lens`, a sequence's state stops advancing once its true length
    /// is reached and its outputs past that point are zero, so padding never
    /// reaches the returned final state. The output always has `seq_len`
    /// steps.
    pub fn unroll(
        &self,
        xs: &Tensor,
        lens: Option<&Tensor>,
        init: StackState,
        train: bool,
    ) -> Result<(Tensor, StackState)> {
        let (_, seq_len, _) = xs.dims3()?;
        let device = xs.device().clone();
        let mut state = init;
        let mut outputs = Vec::with_capacity(seq_len);

        for t in 0..seq_len {
            let x_t = xs.i((.., t, ..))?.contiguous()?;
            let (out, next) = self.step(&x_t, &state, train)?;
            let (out, next) = match lens {
                Some(lens) => {
                    // (batch,) -> (batch, 1) broadcast over the hidden dim
                    let active = lens.gt(t as u32)?.unsqueeze(1)?;
                    let active = active.broadcast_as(out.shape())?;
                    let out = active.where_cond(&out, &out.zeros_like()?)?;
                    let next = next
                        .into_iter()
                        .zip(&state)
                        .map(|(new, old)| {
                            let h = active.where_cond(new.h(), old.h())?;
                            let c = active.where_cond(new.c(), old.c())?;
                            Ok(LSTMState::new(h, c))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    (out, next)
                }
                None => (out, next),
            };
            outputs.push(self.stage(out)?);
            state = next;
        }

        let outputs = Tensor::stack(&outputs, 1)?.to_device(&device)?;
        Ok((outputs, state))
    }

    fn stage(&self, xs: Tensor) -> Result<Tensor> {
        if self.swap_memory {
            xs.to_device(&Device::Cpu)
        } else {
            Ok(xs)
        }
    }
}
