use std::fs;
use std::path::PathBuf;

use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, Seq2SeqError};

const STATE_FILE: &str = "checkpoint.json";

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointState {
    model_checkpoint_path: PathBuf,
}

/// Saves and restores every variable of a `VarMap` as one safetensors file.
/// `checkpoint.json` in the same directory points at the latest save.
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Seq2SeqError::Config(format!(
                "directory {} not found",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// Writes to a temporary file first and renames it into place, so an
    /// interrupted save leaves the previous checkpoint intact.
    pub fn save(&self, varmap: &VarMap, name: &str) -> Result<PathBuf> {
        let path = self.dir.join(format!("{name}.safetensors"));
        let tmp = self.dir.join(format!("{name}.safetensors.tmp"));
        varmap.save(&tmp)?;
        fs::rename(&tmp, &path)?;

        let state = CheckpointState {
            model_checkpoint_path: path.clone(),
        };
        let state_tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&state_tmp, serde_json::to_string_pretty(&state)?)?;
        fs::rename(&state_tmp, self.dir.join(STATE_FILE))?;
        tracing::debug!("saved checkpoint to {}", path.display());
        Ok(path)
    }

    /// Overwrites every variable in `varmap` with the latest saved values.
    /// The variables must already exist, i.e. the model is built first.
    pub fn load(&self, varmap: &mut VarMap) -> Result<PathBuf> {
        tracing::info!("[*] Reading checkpoints...");
        let not_found = || Seq2SeqError::CheckpointNotFound(self.dir.clone());

        let state = fs::read_to_string(self.dir.join(STATE_FILE)).map_err(|_| not_found())?;
        let state: CheckpointState = serde_json::from_str(&state)?;
        if !state.model_checkpoint_path.is_file() {
            return Err(not_found());
        }
        varmap.load(&state.model_checkpoint_path)?;
        Ok(state.model_checkpoint_path)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{Init, VarBuilder};

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_missing_directory() {
        let result = CheckpointManager::new("/no/such/checkpoint/dir");
        assert!(matches!(result, Err(Seq2SeqError::Config(_))));
    }

    #[test]
    fn test_load_without_checkpoint() {
        let dir = scratch_dir("ckpt-empty");
        let manager = CheckpointManager::new(&dir).unwrap();
        let mut varmap = VarMap::new();
        let result = manager.load(&mut varmap);
        fs::remove_dir_all(&dir).ok();
        assert!(matches!(result, Err(Seq2SeqError::CheckpointNotFound(_))));
    }

    #[test]
    fn test_save_then_restore() {
        let dir = scratch_dir("ckpt-roundtrip");
        let manager = CheckpointManager::new(&dir).unwrap();
        let device = Device::Cpu;

        let saved = VarMap::new();
        let vb = VarBuilder::from_varmap(&saved, DType::F32, &device);
        let w = vb
            .get_with_hints((2, 3), "w", Init::Uniform { lo: -1., up: 1. })
            .unwrap();
        manager.save(&saved, "attention").unwrap();

        let mut restored = VarMap::new();
        let vb = VarBuilder::from_varmap(&restored, DType::F32, &device);
        let fresh = vb.get_with_hints((2, 3), "w", Init::Const(0.)).unwrap();
        let path = manager.load(&mut restored).unwrap();
        fs::remove_dir_all(&dir).ok();

        assert_eq!(path.file_name().unwrap(), "attention.safetensors");
        assert_eq!(fresh.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn test_second_save_replaces_first() {
        let dir = scratch_dir("ckpt-resave");
        let manager = CheckpointManager::new(&dir).unwrap();
        let device = Device::Cpu;

        let mut saved = VarMap::new();
        let vb = VarBuilder::from_varmap(&saved, DType::F32, &device);
        let w = vb.get_with_hints((2, 2), "w", Init::Const(1.)).unwrap();
        manager.save(&saved, "attention").unwrap();
        saved
            .set_one("w", Tensor::full(3f32, (2, 2), &device).unwrap())
            .unwrap();
        manager.save(&saved, "attention").unwrap();

        let mut restored = VarMap::new();
        let vb = VarBuilder::from_varmap(&restored, DType::F32, &device);
        let fresh = vb.get_with_hints((2, 2), "w", Init::Const(0.)).unwrap();
        let result = manager.load(&mut restored);
        let leftovers = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        fs::remove_dir_all(&dir).ok();

        result.unwrap();
        assert_eq!(leftovers, 0);
        assert_eq!(fresh.to_vec2::<f32>().unwrap(), w.to_vec2::<f32>().unwrap());
        assert_eq!(fresh.to_vec2::<f32>().unwrap(), vec![vec![3f32, 3.]; 2]);
    }
}
