use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::recurrent::{StackState, StackedLstm};

pub struct Encoder {
    lstm: StackedLstm,
}

impl Encoder {
    pub fn new(
        hidden_size: usize,
        num_layers: usize,
        drop_p: f32,
        init: Init,
        swap_memory: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let lstm = StackedLstm::new(hidden_size, num_layers, drop_p, init, swap_memory, vb)?;
        Ok(Self { lstm })
    }

    /// Encodes projected source tokens `(batch, max_size, hidden_size)`.
    ///
    /// Returns the top-layer output for every source position, still
    /// `max_size` long, and the per-layer state at each sequence's true
    /// length, which seeds the decoder.
    pub fn forward(&self, xs: &Tensor, lens: &Tensor, train: bool) -> Result<(Tensor, StackState)> {
        let (batch_size, _, _) = xs.dims3()?;
        let init = self.lstm.zero_state(batch_size)?;
        let (hs, state) = self.lstm.unroll(xs, Some(lens), init, train)?;
        // attention reads this as a fixed memory bank
        Ok((hs.contiguous()?, state))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;
    use crate::utils::uniform;

    #[test]
    fn test_encoder_output_spans_max_size() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(4, 2, 0.0, uniform(-0.1, 0.1), false, vb).unwrap();

        let xs = Tensor::rand(-1f32, 1., (3, 5, 4), &device).unwrap();
        let lens = Tensor::new(&[1u32, 5, 3], &device).unwrap();
        let (hs, state) = encoder.forward(&xs, &lens, false).unwrap();

        assert_eq!(hs.dims3().unwrap(), (3, 5, 4));
        assert_eq!(state.len(), 2);
        assert_eq!(state[1].h().dims2().unwrap(), (3, 4));
    }
}
