pub mod input_embedding;

pub use input_embedding::InputEmbedding;
