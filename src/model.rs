use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{Module, VarBuilder};

use crate::{
    attention::{Attention, AttentionOutput},
    config::{Config, Mode},
    dataset::SequenceBatch,
    decoder::Decoder,
    embeddings::InputEmbedding,
    encoder::Encoder,
    recurrent::StackState,
    utils::{length_mask, uniform},
};

/// Per-step outputs stacked along the time axis.
pub struct Forward {
    /// `(batch, max_size, t_nwords)`
    pub logits: Tensor,
    /// `(batch, max_size, t_nwords)`
    pub probs: Tensor,
    /// `(batch, max_size, max_size)`: decoder step x source position
    pub alignments: Tensor,
}

impl Forward {
    fn from_steps(steps: Vec<AttentionOutput>) -> Result<Self> {
        let logits = steps.iter().map(|s| s.logit.clone()).collect::<Vec<_>>();
        let probs = steps.iter().map(|s| s.prob.clone()).collect::<Vec<_>>();
        let alignments = steps.iter().map(|s| s.alignment.clone()).collect::<Vec<_>>();
        Ok(Self {
            logits: Tensor::stack(&logits, 1)?,
            probs: Tensor::stack(&probs, 1)?,
            alignments: Tensor::stack(&alignments, 1)?,
        })
    }

    /// Greedy token choice at every step, `(batch, max_size)` u32.
    pub fn predictions(&self) -> Result<Tensor> {
        self.probs.argmax(D::Minus1)
    }
}

/// Every trainable tensor of the model. Built once per model and shared by
/// all time steps; parameter names are scoped `encoder.*`, `decoder.*`
/// and `attention.*`.
pub struct Seq2SeqAttention {
    src_embed: InputEmbedding,
    tgt_embed: InputEmbedding,
    encoder: Encoder,
    decoder: Decoder,
    attention: Attention,
    mask_source_padding: bool,
}

struct Encoded {
    hs: Tensor,
    state: StackState,
    src_mask: Option<Tensor>,
}

impl Seq2SeqAttention {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let init = uniform(config.minval, config.maxval);
        let enc_vb = vb.pp("encoder");
        let dec_vb = vb.pp("decoder");

        let src_embed = InputEmbedding::new(
            config.s_nwords,
            config.emb_size,
            config.hidden_size,
            init,
            enc_vb.pp("embed"),
        )?;
        let tgt_embed = InputEmbedding::new(
            config.t_nwords,
            config.emb_size,
            config.hidden_size,
            init,
            dec_vb.pp("embed"),
        )?;
        let encoder = Encoder::new(
            config.hidden_size,
            config.num_layers,
            config.dropout,
            init,
            config.swap_memory,
            enc_vb.pp("lstm"),
        )?;
        let decoder = Decoder::new(
            config.hidden_size,
            config.num_layers,
            config.dropout,
            init,
            config.swap_memory,
            dec_vb.pp("lstm"),
        )?;
        let attention = Attention::new(
            config.hidden_size,
            config.emb_size,
            config.t_nwords,
            init,
            vb.pp("attention"),
        )?;

        Ok(Self {
            src_embed,
            tgt_embed,
            encoder,
            decoder,
            attention,
            mask_source_padding: config.mask_source_padding,
        })
    }

    fn encode(&self, batch: &SequenceBatch, train: bool) -> Result<Encoded> {
        let xs = self.src_embed.forward(&batch.source)?;
        let (hs, state) = self.encoder.forward(&xs, &batch.source_len, train)?;
        let src_mask = if self.mask_source_padding {
            Some(length_mask(&batch.source_len, hs.dim(1)?)?)
        } else {
            None
        };
        Ok(Encoded {
            hs,
            state,
            src_mask,
        })
    }
}

/// A forward pass over one batch. Implementations differ only in what the
/// decoder reads at each step.
pub trait ForwardGraph {
    fn forward(&self, batch: &SequenceBatch, train: bool) -> Result<Forward>;

    fn mode(&self) -> Mode;
}

/// Teacher forcing: the decoder runs over the ground-truth target in one
/// pass, then attention is applied to each decoder output.
pub struct TrainingGraph(Seq2SeqAttention);

impl ForwardGraph for TrainingGraph {
    fn forward(&self, batch: &SequenceBatch, train: bool) -> Result<Forward> {
        let model = &self.0;
        let encoded = model.encode(batch, train)?;

        let xs = model.tgt_embed.forward(&batch.target)?;
        let (decoder_hs, _) = model
            .decoder
            .forward(&xs, &batch.target_len, encoded.state, train)?;

        let max_size = decoder_hs.dim(1)?;
        let steps = (0..max_size)
            .map(|t| {
                let h_t = decoder_hs.i((.., t, ..))?.contiguous()?;
                model
                    .attention
                    .forward(&h_t, &encoded.hs, encoded.src_mask.as_ref())
            })
            .collect::<Result<Vec<_>>>()?;
        Forward::from_steps(steps)
    }

    fn mode(&self) -> Mode {
        Mode::Train
    }
}

/// Greedy decoding: step 0 reads `<s>`, every later step reads the argmax
/// of the previous step's distribution.
pub struct InferenceGraph(Seq2SeqAttention);

impl ForwardGraph for InferenceGraph {
    fn forward(&self, batch: &SequenceBatch, train: bool) -> Result<Forward> {
        let model = &self.0;
        let encoded = model.encode(batch, train)?;
        let max_size = batch.target.dim(1)?;

        let mut x = model.tgt_embed.forward(&batch.target.i((.., 0))?)?;
        let mut state = encoded.state;
        let mut steps = Vec::with_capacity(max_size);
        for _ in 0..max_size {
            let (h_t, next) = model.decoder.step(&x, &state, train)?;
            let out = model
                .attention
                .forward(&h_t, &encoded.hs, encoded.src_mask.as_ref())?;
            let idxs = out.prob.argmax(D::Minus1)?;
            x = model.tgt_embed.forward(&idxs)?;
            state = next;
            steps.push(out);
        }
        Forward::from_steps(steps)
    }

    fn mode(&self) -> Mode {
        Mode::Inference
    }
}

/// Builds the parameters and picks the forward graph for `config.mode`.
pub fn attention_model(config: &Config, vb: VarBuilder) -> Result<Box<dyn ForwardGraph>> {
    let params = Seq2SeqAttention::new(config, vb)?;
    let graph: Box<dyn ForwardGraph> = match config.mode {
        Mode::Train => Box::new(TrainingGraph(params)),
        Mode::Inference => Box::new(InferenceGraph(params)),
    };
    Ok(graph)
}
