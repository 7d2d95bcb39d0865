use candle_core::{Result, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::{Init, Linear, VarBuilder};

use crate::utils::{linear_init, masked_fill};

pub struct AttentionOutput {
    /// `(batch, t_nwords)` pre-softmax scores, used by the loss.
    pub logit: Tensor,
    /// `(batch, t_nwords)` distribution over the target vocabulary.
    pub prob: Tensor,
    /// `(batch, max_size)` distribution over source positions.
    pub alignment: Tensor,
}

/// Concat-score attention over the encoder memory bank, followed by the
/// output projection to target vocabulary logits.
pub struct Attention {
    w_a: Linear,
    v_a: Tensor,
    w_c: Linear,
    proj: Linear,
    proj_out: Linear,
}

impl Attention {
    pub fn new(
        hidden_size: usize,
        emb_size: usize,
        t_nwords: usize,
        init: Init,
        vb: VarBuilder,
    ) -> Result<Self> {
        let w_a = linear_init(2 * hidden_size, hidden_size, init, vb.pp("w_a"))?;
        let v_a = vb.get_with_hints((hidden_size, 1), "v_a", init)?;
        let w_c = linear_init(2 * hidden_size, hidden_size, init, vb.pp("w_c"))?;
        let proj = linear_init(hidden_size, emb_size, init, vb.pp("proj"))?;
        let proj_out = linear_init(emb_size, t_nwords, init, vb.pp("proj_out"))?;
        Ok(Self {
            w_a,
            v_a,
            w_c,
            proj,
            proj_out,
        })
    }

    /// Raw alignment scores `v_a . tanh(W_a [h_t; h_s] + b_a)` for every
    /// source position `s`.
    fn score(&self, h_t: &Tensor, encoder_hs: &Tensor) -> Result<Tensor> {
        let (batch_size, max_size, hidden_size) = encoder_hs.dims3()?;
        let h_t = h_t
            .unsqueeze(1)?
            .broadcast_as((batch_size, max_size, hidden_size))?;
        // (batch, max_size, 2 * hidden)
        let pairs = Tensor::cat(&[&h_t, encoder_hs], 2)?.contiguous()?;
        let energy = pairs.apply(&self.w_a)?.tanh()?;
        // (batch, max_size, hidden) x (hidden, 1) --> (batch, max_size)
        energy
            .broadcast_matmul(&self.v_a)?
            .squeeze(2)
    }

    /// `h_t` is one decoder output `(batch, hidden)`, `encoder_hs` the full
    /// encoder output `(batch, max_size, hidden)`. With `src_mask`
    /// (`(batch, max_size)`, 1 on real tokens) padded positions get zero
    /// attention weight.
    pub fn forward(
        &self,
        h_t: &Tensor,
        encoder_hs: &Tensor,
        src_mask: Option<&Tensor>,
    ) -> Result<AttentionOutput> {
        let scores = self.score(h_t, encoder_hs)?;
        let scores = match src_mask {
            Some(mask) => masked_fill(&scores, mask)?,
            None => scores,
        };
        // softmax over source positions; subtracts the row max before exp
        let alignment = softmax(&scores, D::Minus1)?;

        // (batch, 1, max_size) x (batch, max_size, hidden) --> (batch, hidden)
        let context = alignment.unsqueeze(1)?.matmul(encoder_hs)?.squeeze(1)?;
        let h_tilde = Tensor::cat(&[h_t, &context], 1)?
            .contiguous()?
            .apply(&self.w_c)?
            .tanh()?;

        let logit = h_tilde.apply(&self.proj)?.apply(&self.proj_out)?;
        let prob = softmax(&logit, D::Minus1)?;

        Ok(AttentionOutput {
            logit,
            prob,
            alignment,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;
    use crate::utils::{length_mask, uniform};

    fn attention(device: &Device) -> Attention {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Attention::new(4, 3, 6, uniform(-0.5, 0.5), vb).unwrap()
    }

    #[test]
    fn test_alignment_is_a_distribution() {
        let device = Device::Cpu;
        let attention = attention(&device);
        let h_t = Tensor::rand(-1f32, 1., (3, 4), &device).unwrap();
        let encoder_hs = Tensor::rand(-1f32, 1., (3, 5, 4), &device).unwrap();

        let out = attention.forward(&h_t, &encoder_hs, None).unwrap();

        assert_eq!(out.alignment.dims2().unwrap(), (3, 5));
        assert_eq!(out.logit.dims2().unwrap(), (3, 6));
        for row in out.alignment.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|p| *p >= 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        for row in out.prob.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|p| *p >= 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_padding_gets_no_weight() {
        let device = Device::Cpu;
        let attention = attention(&device);
        let h_t = Tensor::rand(-1f32, 1., (2, 4), &device).unwrap();
        let encoder_hs = Tensor::rand(-1f32, 1., (2, 4, 4), &device).unwrap();
        let lens = Tensor::new(&[2u32, 4], &device).unwrap();
        let mask = length_mask(&lens, 4).unwrap();

        let out = attention.forward(&h_t, &encoder_hs, Some(&mask)).unwrap();
        let rows = out.alignment.to_vec2::<f32>().unwrap();

        assert_eq!(rows[0][2], 0.0);
        assert_eq!(rows[0][3], 0.0);
        assert!((rows[0][0] + rows[0][1] - 1.0).abs() < 1e-5);
        assert!(rows[1].iter().all(|p| *p > 0.0));
    }

    #[test]
    fn test_large_scores_stay_finite() {
        let device = Device::Cpu;
        let scores = Tensor::new(&[[1e4f32, 1e4 - 1.0, -1e4]], &device).unwrap();
        let probs = softmax(&scores, D::Minus1).unwrap().to_vec2::<f32>().unwrap();
        assert!(probs[0].iter().all(|p| p.is_finite()));
        assert!((probs[0].iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_identical_states_share_weight_evenly() {
        let device = Device::Cpu;
        let attention = attention(&device);
        // identical memory rows score the same whatever the weights
        let row = Tensor::new(&[[0.3f32, -0.2, 0.1, 0.7]], &device).unwrap();
        let encoder_hs = row.unsqueeze(1).unwrap().repeat((1, 3, 1)).unwrap();
        let h_t = Tensor::zeros((1, 4), DType::F32, &device).unwrap();

        let out = attention.forward(&h_t, &encoder_hs, None).unwrap();
        let weights = out.alignment.to_vec2::<f32>().unwrap();
        for p in &weights[0] {
            assert!((p - 1.0 / 3.0).abs() < 1e-5);
        }
    }
}
