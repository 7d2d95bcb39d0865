use std::path::PathBuf;

use chrono::{Datelike, Local, Timelike};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::{Result, Seq2SeqError};

/// Which forward graph a model instance is built with. Fixed for the
/// lifetime of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Mode {
    /// Teacher forcing: the decoder reads the ground-truth target.
    Train,
    /// Greedy decoding: the decoder reads its own previous prediction.
    Inference,
}

#[derive(Debug, Clone, Args, Serialize, Deserialize)]
pub struct Config {
    #[arg(long, default_value_t = 256)]
    pub hidden_size: usize,
    #[arg(long, default_value_t = 2)]
    pub num_layers: usize,
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,
    #[arg(long, default_value_t = 30)]
    pub max_size: usize,
    #[arg(long, default_value_t = 0.2)]
    pub dropout: f32,
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,
    #[arg(long, default_value_t = 10000)]
    pub s_nwords: usize,
    #[arg(long, default_value_t = 10000)]
    pub t_nwords: usize,
    #[arg(long, default_value_t = -0.1, allow_hyphen_values = true)]
    pub minval: f64,
    #[arg(long, default_value_t = 0.1)]
    pub maxval: f64,
    #[arg(long, default_value_t = 1.0)]
    pub lr_init: f64,
    #[arg(long, default_value_t = 5.0)]
    pub max_grad_norm: f64,
    #[arg(long, default_value_t = 256)]
    pub emb_size: usize,
    /// Epoch after which the learning rate starts decaying.
    #[arg(long, default_value_t = 5)]
    pub lr_decay_after: usize,
    #[arg(long, default_value_t = 0.5)]
    pub lr_decay_factor: f64,
    #[arg(long, value_enum, default_value_t = Mode::Train)]
    pub mode: Mode,
    #[arg(long, default_value = "attention")]
    pub name: String,
    #[arg(long, default_value = "small")]
    pub dataset: String,
    #[arg(long, default_value = "data/train.src")]
    pub source_data_path: PathBuf,
    #[arg(long, default_value = "data/train.tgt")]
    pub target_data_path: PathBuf,
    #[arg(long, default_value = "data/vocab.src")]
    pub source_vocab_path: PathBuf,
    #[arg(long, default_value = "data/vocab.tgt")]
    pub target_vocab_path: PathBuf,
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,
    /// Stage per-step recurrent activations on the host device.
    #[arg(long)]
    pub swap_memory: bool,
    /// Let attention see source positions past the true source length.
    #[arg(long = "attend-to-padding", action = clap::ArgAction::SetFalse)]
    pub mask_source_padding: bool,
    #[arg(long)]
    pub shuffle: bool,
    #[arg(long)]
    pub cpu: bool,
    #[arg(long, default_value_t = 10)]
    pub log_every: usize,
    #[arg(long, default_value_t = 2)]
    pub summary_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hidden_size: 256,
            num_layers: 2,
            batch_size: 64,
            max_size: 30,
            dropout: 0.2,
            epochs: 10,
            s_nwords: 10000,
            t_nwords: 10000,
            minval: -0.1,
            maxval: 0.1,
            lr_init: 1.0,
            max_grad_norm: 5.0,
            emb_size: 256,
            lr_decay_after: 5,
            lr_decay_factor: 0.5,
            mode: Mode::Train,
            name: "attention".to_string(),
            dataset: "small".to_string(),
            source_data_path: PathBuf::from("data/train.src"),
            target_data_path: PathBuf::from("data/train.tgt"),
            source_vocab_path: PathBuf::from("data/vocab.src"),
            target_vocab_path: PathBuf::from("data/vocab.tgt"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            log_dir: PathBuf::from("logs"),
            swap_memory: false,
            mask_source_padding: true,
            shuffle: false,
            cpu: false,
            log_every: 10,
            summary_every: 2,
        }
    }
}

impl Config {
    /// Checks the configuration before any tensor is allocated.
    pub fn validate(&self) -> Result<()> {
        if !self.checkpoint_dir.is_dir() {
            return Err(Seq2SeqError::Config(format!(
                "directory {} not found",
                self.checkpoint_dir.display()
            )));
        }
        let sizes = [
            ("hidden_size", self.hidden_size),
            ("num_layers", self.num_layers),
            ("batch_size", self.batch_size),
            ("emb_size", self.emb_size),
            ("s_nwords", self.s_nwords),
            ("t_nwords", self.t_nwords),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Seq2SeqError::Config(format!("{name} must be positive")));
        }
        // one step is always dropped from the loss
        if self.max_size < 2 {
            return Err(Seq2SeqError::Config(format!(
                "max_size must be at least 2, got {}",
                self.max_size
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Seq2SeqError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.minval >= self.maxval {
            return Err(Seq2SeqError::Config(format!(
                "empty init range [{}, {}]",
                self.minval, self.maxval
            )));
        }
        if self.max_grad_norm <= 0.0 || self.lr_init <= 0.0 {
            return Err(Seq2SeqError::Config(
                "lr_init and max_grad_norm must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn model_name(&self) -> String {
        let now = Local::now();
        format!(
            "{}-{}-{}-{}-{}",
            self.name,
            self.dataset,
            now.month(),
            now.day(),
            now.hour()
        )
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn test_cli_defaults_match_default() {
        let parsed = Wrapper::try_parse_from(["seq2seq"]).unwrap().config;
        let json = serde_json::to_value(&parsed).unwrap();
        let default = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json, default);
    }

    #[test]
    fn test_attend_to_padding_flag() {
        let parsed = Wrapper::try_parse_from(["seq2seq", "--attend-to-padding"])
            .unwrap()
            .config;
        assert!(!parsed.mask_source_padding);
    }

    #[test]
    fn test_missing_checkpoint_dir_is_config_error() {
        let config = Config {
            checkpoint_dir: PathBuf::from("/definitely/not/a/real/dir"),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Seq2SeqError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_short_sequences() {
        let config = Config {
            checkpoint_dir: std::env::temp_dir(),
            max_size: 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Seq2SeqError::Config(_))));

        let config = Config {
            checkpoint_dir: std::env::temp_dir(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_name_prefix() {
        let config = Config::default();
        assert!(config.model_name().starts_with("attention-small-"));
    }
}
