use candle_core::{Result, Tensor};
use candle_nn::{Embedding, Init, Linear, Module, VarBuilder};

use crate::utils::linear_init;

/// Token lookup followed by a linear map into the recurrent hidden size.
pub struct InputEmbedding {
    embedding: Embedding,
    proj: Linear,
}

impl InputEmbedding {
    pub fn new(
        vocab_size: usize,
        emb_size: usize,
        hidden_size: usize,
        init: Init,
        vb: VarBuilder,
    ) -> Result<Self> {
        let table = vb.get_with_hints((vocab_size, emb_size), "embedding", init)?;
        let embedding = Embedding::new(table, emb_size);
        let proj = linear_init(emb_size, hidden_size, init, vb.pp("proj"))?;
        Ok(Self { embedding, proj })
    }
}

impl Module for InputEmbedding {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        // (batch, seq_len) --> (batch, seq_len, hidden_size)
        // (batch,) --> (batch, hidden_size)
        self.embedding.forward(ids)?.apply(&self.proj)
    }
}
