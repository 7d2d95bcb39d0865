use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;
use tokenizers::{
    DecoderWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper, Tokenizer,
    TokenizerBuilder,
};

use crate::error::{Result, Seq2SeqError};

pub const PAD: &str = "<pad>";
pub const SOS: &str = "<s>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";

/// Word-level vocabulary read from a file with one token per line; the
/// token's id is its line number.
pub struct Vocabulary {
    tokenizer: Tokenizer,
    tokens: Vec<String>,
    pad_id: u32,
    sos_id: u32,
    eos_id: u32,
}

impl Vocabulary {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            Seq2SeqError::Vocabulary(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_tokens(text.lines().map(str::to_string).collect())
    }

    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        let mut vocab = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            // the first occurrence wins, matching line order
            vocab.entry(token.clone()).or_insert(id as u32);
        }
        let reserved = |token: &str| {
            vocab.get(token).copied().ok_or_else(|| {
                Seq2SeqError::Vocabulary(format!("reserved token {token} is missing"))
            })
        };
        let pad_id = reserved(PAD)?;
        let sos_id = reserved(SOS)?;
        let eos_id = reserved(EOS)?;
        reserved(UNK)?;

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(UNK.to_string())
            .build()
            .map_err(|e| Seq2SeqError::Vocabulary(e.to_string()))?;
        let tokenizer = TokenizerBuilder::<
            WordLevel,
            NormalizerWrapper,
            PreTokenizerWrapper,
            PostProcessorWrapper,
            DecoderWrapper,
        >::default()
        .with_model(model)
        .with_pre_tokenizer(Some(PreTokenizerWrapper::WhitespaceSplit(WhitespaceSplit)))
        .build()
        .map_err(|e| Seq2SeqError::Vocabulary(e.to_string()))?;

        Ok(Self {
            tokenizer: Tokenizer::from(tokenizer),
            tokens,
            pad_id,
            sos_id,
            eos_id,
        })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn sos_id(&self) -> u32 {
        self.sos_id
    }

    pub fn eos_id(&self) -> u32 {
        self.eos_id
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }

    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Splits on whitespace; unknown words map to `<unk>`.
    pub fn encode(&self, line: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(line, false)
            .map_err(|e| Seq2SeqError::Vocabulary(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|id| self.token(*id))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
