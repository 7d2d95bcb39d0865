use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::error::{Result, Seq2SeqError};
use crate::vocab::Vocabulary;

/// Padded source/target ids with their true lengths.
#[derive(Debug, Clone)]
pub struct SequenceBatch {
    pub source: Tensor,     // (batch, max_size) u32
    pub source_len: Tensor, // (batch,) u32
    pub target: Tensor,     // (batch, max_size) u32
    pub target_len: Tensor, // (batch,) u32
}

impl SequenceBatch {
    /// Checks the batch contract: both id tensors are `(batch, max_size)`,
    /// both length vectors are `(batch,)` with values in `[1, max_size]`.
    pub fn new(
        source: Tensor,
        source_len: Tensor,
        target: Tensor,
        target_len: Tensor,
        max_size: usize,
    ) -> Result<Self> {
        let (batch_size, width) = source.dims2()?;
        if width != max_size || target.dims2()? != (batch_size, max_size) {
            return Err(Seq2SeqError::InvalidBatch(format!(
                "expected ids of shape ({batch_size}, {max_size}), got {:?} and {:?}",
                source.dims(),
                target.dims()
            )));
        }
        for (name, lens) in [("source", &source_len), ("target", &target_len)] {
            let lens = lens.to_vec1::<u32>().map_err(|e| {
                Seq2SeqError::InvalidBatch(format!("{name} lengths: {e}"))
            })?;
            if lens.len() != batch_size {
                return Err(Seq2SeqError::InvalidBatch(format!(
                    "{} {name} lengths for batch of {batch_size}",
                    lens.len()
                )));
            }
            if let Some(len) = lens.iter().find(|l| **l == 0 || **l as usize > max_size) {
                return Err(Seq2SeqError::InvalidBatch(format!(
                    "{name} length {len} outside [1, {max_size}]"
                )));
            }
        }
        Ok(Self {
            source,
            source_len,
            target,
            target_len,
        })
    }

    pub fn from_rows(
        source: &[Vec<u32>],
        source_len: &[u32],
        target: &[Vec<u32>],
        target_len: &[u32],
        max_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let to_tensor = |rows: &[Vec<u32>]| -> Result<Tensor> {
            if rows.iter().any(|r| r.len() != max_size) {
                return Err(Seq2SeqError::InvalidBatch(format!(
                    "every row must hold {max_size} ids"
                )));
            }
            Ok(Tensor::from_vec(rows.concat(), (rows.len(), max_size), device)?)
        };
        Self::new(
            to_tensor(source)?,
            Tensor::new(source_len, device)?,
            to_tensor(target)?,
            Tensor::new(target_len, device)?,
            max_size,
        )
    }

    pub fn batch_size(&self) -> usize {
        self.source.dims()[0]
    }
}

#[derive(Debug, Clone)]
struct PaddedPair {
    source: Vec<u32>,
    source_len: u32,
    target: Vec<u32>,
    target_len: u32,
}

/// Truncates to `max_size` and right-pads; returns ids and true length.
fn pad(mut ids: Vec<u32>, pad_id: u32, max_size: usize) -> (Vec<u32>, u32) {
    ids.truncate(max_size);
    let len = ids.len() as u32;
    ids.resize(max_size, pad_id);
    (ids, len)
}

/// Line-aligned source/target corpus, already mapped to ids.
pub struct ParallelCorpus {
    pairs: Vec<PaddedPair>,
    max_size: usize,
    device: Device,
}

impl ParallelCorpus {
    /// Source lines become `tokens </s>`, target lines `<s> tokens </s>`.
    pub fn from_files(
        source_path: impl AsRef<Path>,
        target_path: impl AsRef<Path>,
        source_vocab: &Vocabulary,
        target_vocab: &Vocabulary,
        max_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let source_text = fs::read_to_string(source_path)?;
        let target_text = fs::read_to_string(target_path)?;
        let (n_source, n_target) = (source_text.lines().count(), target_text.lines().count());
        if n_source != n_target {
            return Err(Seq2SeqError::InvalidBatch(format!(
                "{n_source} source lines but {n_target} target lines"
            )));
        }

        let pairs = source_text
            .lines()
            .zip(target_text.lines())
            .map(|(src, tgt)| {
                let mut source = source_vocab.encode(src)?;
                source.push(source_vocab.eos_id());
                let mut target = vec![target_vocab.sos_id()];
                target.extend(target_vocab.encode(tgt)?);
                target.push(target_vocab.eos_id());

                let (source, source_len) = pad(source, source_vocab.pad_id(), max_size);
                let (target, target_len) = pad(target, target_vocab.pad_id(), max_size);
                Ok(PaddedPair {
                    source,
                    source_len,
                    target,
                    target_len,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pairs,
            max_size,
            device: device.clone(),
        })
    }

    /// Source sentences to decode; each target is `<s>` followed by padding.
    pub fn source_only(
        source_path: impl AsRef<Path>,
        source_vocab: &Vocabulary,
        target_vocab: &Vocabulary,
        max_size: usize,
        device: &Device,
    ) -> Result<Self> {
        let source_text = fs::read_to_string(source_path)?;
        let pairs = source_text
            .lines()
            .map(|src| {
                let mut source = source_vocab.encode(src)?;
                source.push(source_vocab.eos_id());
                let (source, source_len) = pad(source, source_vocab.pad_id(), max_size);
                let (target, target_len) =
                    pad(vec![target_vocab.sos_id()], target_vocab.pad_id(), max_size);
                Ok(PaddedPair {
                    source,
                    source_len,
                    target,
                    target_len,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pairs,
            max_size,
            device: device.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// One pass over the corpus. Each call starts a fresh pass.
    pub fn batches(&self, batch_size: usize, shuffle: bool) -> Batcher<'_> {
        Batcher::new(self, batch_size, shuffle)
    }
}

pub struct Batcher<'a> {
    corpus: &'a ParallelCorpus,
    order: Vec<usize>,
    batch_size: usize,
    current_idx: usize,
}

impl<'a> Batcher<'a> {
    fn new(corpus: &'a ParallelCorpus, batch_size: usize, shuffle: bool) -> Self {
        let mut order = (0..corpus.pairs.len()).collect::<Vec<_>>();
        if shuffle {
            order.shuffle(&mut thread_rng());
        }
        Self {
            corpus,
            order,
            batch_size: batch_size.max(1),
            current_idx: 0,
        }
    }
}

impl Iterator for Batcher<'_> {
    type Item = Result<SequenceBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.order.len() {
            return None;
        }

        // the last batch may be shorter than `batch_size`
        let end_idx = (self.current_idx + self.batch_size).min(self.order.len());
        let items = self.order[self.current_idx..end_idx]
            .iter()
            .map(|i| &self.corpus.pairs[*i])
            .collect::<Vec<_>>();
        self.current_idx = end_idx;

        let source = items.iter().map(|p| p.source.clone()).collect::<Vec<_>>();
        let source_len = items.iter().map(|p| p.source_len).collect::<Vec<_>>();
        let target = items.iter().map(|p| p.target.clone()).collect::<Vec<_>>();
        let target_len = items.iter().map(|p| p.target_len).collect::<Vec<_>>();

        Some(SequenceBatch::from_rows(
            &source,
            &source_len,
            &target,
            &target_len,
            self.corpus.max_size,
            &self.corpus.device,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        let tokens = ["<pad>", "<s>", "</s>", "<unk>", "a", "b", "c"];
        Vocabulary::from_tokens(tokens.iter().map(|t| t.to_string()).collect()).unwrap()
    }

    fn write(name: &str, text: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{name}-{}.txt", std::process::id()));
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_corpus_padding_and_lengths() {
        let vocab = vocab();
        let src = write("corpus-src", "a b\nc c c c c\nb\n");
        let tgt = write("corpus-tgt", "b\na b c\nc c\n");
        let corpus = ParallelCorpus::from_files(&src, &tgt, &vocab, &vocab, 4, &Device::Cpu).unwrap();
        fs::remove_file(src).ok();
        fs::remove_file(tgt).ok();

        assert_eq!(corpus.len(), 3);
        let batches = corpus
            .batches(2, false)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].batch_size(), 1);

        let first = &batches[0];
        assert_eq!(
            first.source.to_vec2::<u32>().unwrap(),
            vec![vec![4, 5, 2, 0], vec![6, 6, 6, 6]]
        );
        assert_eq!(first.source_len.to_vec1::<u32>().unwrap(), vec![3, 4]);
        assert_eq!(
            first.target.to_vec2::<u32>().unwrap(),
            vec![vec![1, 5, 2, 0], vec![1, 4, 5, 6]]
        );
        assert_eq!(first.target_len.to_vec1::<u32>().unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_unaligned_files_are_rejected() {
        let vocab = vocab();
        let src = write("unaligned-src", "a\nb\nc\na b\n");
        let tgt = write("unaligned-tgt", "b\n");
        let corpus = ParallelCorpus::from_files(&src, &tgt, &vocab, &vocab, 4, &Device::Cpu);
        fs::remove_file(src).ok();
        fs::remove_file(tgt).ok();

        match corpus {
            Err(Seq2SeqError::InvalidBatch(msg)) => {
                assert!(msg.contains('4') && msg.contains('1'), "{msg}")
            }
            other => panic!("expected InvalidBatch, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn test_batches_restart() {
        let vocab = vocab();
        let src = write("restart-src", "a\nb\nc\n");
        let corpus = ParallelCorpus::source_only(&src, &vocab, &vocab, 3, &Device::Cpu).unwrap();
        fs::remove_file(src).ok();

        for _ in 0..2 {
            let batches = corpus.batches(2, true).collect::<Result<Vec<_>>>().unwrap();
            let rows: usize = batches.iter().map(|b| b.batch_size()).sum();
            assert_eq!(rows, 3);
            for batch in &batches {
                for row in batch.target.to_vec2::<u32>().unwrap() {
                    assert_eq!(row, vec![1, 0, 0]);
                }
                assert!(batch.target_len.to_vec1::<u32>().unwrap().iter().all(|l| *l == 1));
            }
        }
    }

    #[test]
    fn test_length_outside_range_is_rejected() {
        let device = Device::Cpu;
        let rows = vec![vec![4u32, 2, 0]];
        let zero = SequenceBatch::from_rows(&rows, &[0], &rows, &[2], 3, &device);
        assert!(matches!(zero, Err(Seq2SeqError::InvalidBatch(_))));
        let long = SequenceBatch::from_rows(&rows, &[2], &rows, &[4], 3, &device);
        assert!(matches!(long, Err(Seq2SeqError::InvalidBatch(_))));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let device = Device::Cpu;
        let source = Tensor::zeros((1, 3), candle_core::DType::U32, &device).unwrap();
        let target = Tensor::zeros((1, 4), candle_core::DType::U32, &device).unwrap();
        let lens = Tensor::new(&[1u32], &device).unwrap();
        let batch = SequenceBatch::new(source, lens.clone(), target, lens, 3);
        assert!(matches!(batch, Err(Seq2SeqError::InvalidBatch(_))));
    }
}
