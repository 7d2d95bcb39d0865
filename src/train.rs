use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

use crate::{
    checkpoint::CheckpointManager,
    config::Config,
    dataset::ParallelCorpus,
    error::Seq2SeqError,
    metrics::{perplexity, report, MetricsLogger, StepMetrics},
    model::{attention_model, ForwardGraph},
    optim::{sequence_loss, ClippedSgd, LrSchedule},
    utils::device,
    vocab::Vocabulary,
};

pub struct Trainer {
    config: Config,
    device: Device,
    varmap: VarMap,
    model: Box<dyn ForwardGraph>,
    optimizer: ClippedSgd,
    schedule: LrSchedule,
    checkpoints: CheckpointManager,
    source_vocab: Vocabulary,
    target_vocab: Vocabulary,
    step: usize,
    started: Instant,
}

impl Trainer {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let device = device(config.cpu)?;

        let source_vocab = Vocabulary::from_file(&config.source_vocab_path)?;
        let target_vocab = Vocabulary::from_file(&config.target_vocab_path)?;
        if source_vocab.len() > config.s_nwords || target_vocab.len() > config.t_nwords {
            return Err(Seq2SeqError::Config(format!(
                "vocabularies hold {}/{} words but the model is sized for {}/{}",
                source_vocab.len(),
                target_vocab.len(),
                config.s_nwords,
                config.t_nwords
            ))
            .into());
        }
        tracing::info!(
            "src_vocab size: {}, tgt_vocab size: {}",
            source_vocab.len(),
            target_vocab.len()
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = attention_model(&config, vb)?;
        let optimizer = ClippedSgd::new(varmap.all_vars(), config.lr_init, config.max_grad_norm)?;
        let schedule = LrSchedule::new(config.lr_init, config.lr_decay_after, config.lr_decay_factor);
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir)?;
        tracing::info!("model ready: {:?} mode on {:?}", model.mode(), device);

        Ok(Self {
            config,
            device,
            varmap,
            model,
            optimizer,
            schedule,
            checkpoints,
            source_vocab,
            target_vocab,
            step: 0,
            started: Instant::now(),
        })
    }

    fn corpus(&self, source: &Path, target: &Path) -> Result<ParallelCorpus> {
        Ok(ParallelCorpus::from_files(
            source,
            target,
            &self.source_vocab,
            &self.target_vocab,
            self.config.max_size,
            &self.device,
        )?)
    }

    /// One pass over the training corpus. `epoch` is 1-based. Returns the
    /// mean batch loss.
    pub fn train_epoch(&mut self, epoch: usize, metrics: Option<&MetricsLogger>) -> Result<f64> {
        let lr = self.schedule.on_epoch_start(epoch);
        let corpus = self.corpus(&self.config.source_data_path, &self.config.target_data_path)?;
        if corpus.is_empty() {
            bail!(
                "no training data in {}",
                self.config.source_data_path.display()
            );
        }

        let mut total_loss = 0f64;
        let mut batches = 0usize;
        for batch in corpus.batches(self.config.batch_size, self.config.shuffle) {
            let batch = batch?;
            let out = self.model.forward(&batch, true)?;
            let loss = sequence_loss(&out.logits, &batch.target)?;
            let stats = self.optimizer.backward_step(&loss, lr)?;
            let loss = loss.to_vec0::<f32>()? as f64;

            if self.step % self.config.summary_every.max(1) == 0 {
                if let Some(metrics) = metrics {
                    metrics.log_best_effort(&StepMetrics {
                        step: self.step,
                        loss,
                        grad_norm: stats.grad_norm,
                        lr: stats.lr,
                    });
                }
            }
            if self.step % self.config.log_every.max(1) == 0 {
                report(self.started.elapsed(), epoch, self.step, stats.lr, loss);
            }

            total_loss += loss;
            batches += 1;
            self.step += 1;
        }
        Ok(total_loss / batches as f64)
    }

    /// Mean loss over a held-out corpus with dropout disabled.
    pub fn evaluate(&self, source: &Path, target: &Path) -> Result<f64> {
        let corpus = self.corpus(source, target)?;
        if corpus.is_empty() {
            bail!("no evaluation data in {}", source.display());
        }

        let mut total_loss = 0f64;
        let mut batches = 0usize;
        for batch in corpus.batches(self.config.batch_size, false) {
            let batch = batch?;
            let out = self.model.forward(&batch, false)?;
            total_loss += sequence_loss(&out.logits, &batch.target)?.to_vec0::<f32>()? as f64;
            batches += 1;
        }
        Ok(total_loss / batches as f64)
    }

    /// Greedy translations of every line in `source`, cut at `</s>`.
    pub fn sample(&self, source: &Path) -> Result<Vec<String>> {
        let corpus = ParallelCorpus::source_only(
            source,
            &self.source_vocab,
            &self.target_vocab,
            self.config.max_size,
            &self.device,
        )?;

        let eos_id = self.target_vocab.eos_id();
        let mut lines = Vec::with_capacity(corpus.len());
        for batch in corpus.batches(self.config.batch_size, false) {
            let batch = batch?;
            let predictions = self.model.forward(&batch, false)?.predictions()?;
            for row in predictions.to_vec2::<u32>()? {
                let ids = row
                    .into_iter()
                    .take_while(|id| *id != eos_id)
                    .collect::<Vec<_>>();
                lines.push(self.target_vocab.decode(&ids));
            }
        }
        Ok(lines)
    }

    /// Trains for `config.epochs` epochs, validating after each one and
    /// saving whenever validation loss improves. Returns the best
    /// validation loss.
    pub fn run(&mut self, valid_source: &Path, valid_target: &Path) -> Result<f64> {
        let metrics = match MetricsLogger::new(&self.config.log_dir, &self.config.model_name()) {
            Ok(logger) => Some(logger),
            Err(e) => {
                tracing::warn!("metric summaries disabled: {e}");
                None
            }
        };

        let mut best_valid_loss = f64::INFINITY;
        for epoch in 1..=self.config.epochs {
            let train_loss = self.train_epoch(epoch, metrics.as_ref())?;
            let valid_loss = self.evaluate(valid_source, valid_target)?;
            tracing::info!(
                "[Train] [Epoch: {}] [lr: {}] [Avg. Loss: {:.4}] [Avg. Perplexity: {:.4}]",
                epoch,
                self.schedule.lr(),
                train_loss,
                perplexity(train_loss)
            );
            tracing::info!(
                "[Valid] [Loss: {:.4}] [Perplexity: {:.4}]",
                valid_loss,
                perplexity(valid_loss)
            );

            if epoch == 1 || valid_loss < best_valid_loss {
                best_valid_loss = valid_loss;
                if let Err(e) = self.checkpoints.save(&self.varmap, &self.config.name) {
                    tracing::warn!("checkpoint skipped after epoch {epoch}: {e}");
                }
            }
        }
        Ok(best_valid_loss)
    }

    pub fn load(&mut self) -> Result<()> {
        let path = self.checkpoints.load(&mut self.varmap)?;
        tracing::info!("restored {}", path.display());
        Ok(())
    }
}
