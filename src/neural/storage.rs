// projeto: sagmilltrain
// file: src/neural/storage.rs
// Checkpoint and run-summary persistence on disk

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::neural::model::ModelWeights;
use crate::neural::utils::TrainingError;

/// End-of-run record exported next to the checkpoint, JSON so it stays
/// readable without the binary format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub csv_path: String,
    pub target_names: Vec<String>,
    pub input_channels: usize,
    pub num_parameters: usize,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    pub test_loss: f64,
    pub train_loss_history: Vec<f64>,
    pub val_loss_history: Vec<f64>,
    pub finished_at: String,
}

pub fn save_checkpoint<P: AsRef<Path>>(
    weights: &ModelWeights,
    path: P,
) -> Result<(), TrainingError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let encoded = bincode::serde::encode_to_vec(weights, bincode::config::standard())
        .map_err(|e| TrainingError::Serialization(format!("Failed to encode checkpoint: {}", e)))?;
    fs::write(path, &encoded)?;

    println!("💾 [Storage] Checkpoint saved to: {}", path.display());
    println!("   - Epoch: {}", weights.epoch);
    println!("   - Validation Loss: {:.6}", weights.val_loss);
    println!("   - Size: {} bytes", encoded.len());
    Ok(())
}

pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<ModelWeights, TrainingError> {
    let path = path.as_ref();
    println!("📂 [Storage] Loading checkpoint from: {}", path.display());

    let bytes = fs::read(path)?;
    let (weights, _): (ModelWeights, usize) =
        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| TrainingError::Serialization(format!("Failed to decode checkpoint: {}", e)))?;

    println!("✅ [Storage] Checkpoint loaded (epoch {})", weights.epoch);
    Ok(weights)
}

pub fn export_summary_json<P: AsRef<Path>>(
    summary: &RunSummary,
    path: P,
) -> Result<(), TrainingError> {
    let json = serde_json::to_string_pretty(summary)
        .map_err(|e| TrainingError::Serialization(format!("Failed to serialize summary: {}", e)))?;
    fs::write(path.as_ref(), json)?;
    println!("💾 [Storage] Run summary saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neural::model::{Activation, MillLstm, MillLstmConfig};

    fn small_weights() -> ModelWeights {
        let model = MillLstm::new(MillLstmConfig {
            input_dim: 3,
            hidden_sizes: vec![4, 3],
            activations: vec![Activation::Tanh, Activation::Relu],
            output_dim: 2,
            dropout: 0.1,
            recurrent_dropout: 0.5,
        })
        .unwrap();

        let mut weights = model.get_weights();
        weights.epoch = 7;
        weights.val_loss = 0.42;
        weights.lookback = 1440;
        weights.delay = 10;
        weights.step = 1;
        weights.target_names = vec!["a".to_string(), "b".to_string()];
        weights
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let weights = small_weights();
        let path = std::env::temp_dir().join("sagmill_checkpoint_test.bin");

        save_checkpoint(&weights, &path).unwrap();
        let loaded = load_checkpoint(&path).unwrap();

        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.lookback, 1440);
        assert_eq!(loaded.target_names, weights.target_names);
        assert_eq!(loaded.config.hidden_sizes, vec![4, 3]);
        assert_eq!(loaded.layers[0].w_ii, weights.layers[0].w_ii);
        assert_eq!(loaded.head.b, weights.head.b);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_missing_checkpoint_fails() {
        let path = std::env::temp_dir().join("sagmill_checkpoint_does_not_exist.bin");
        assert!(load_checkpoint(&path).is_err());
    }

    #[test]
    fn test_summary_export() {
        let summary = RunSummary {
            csv_path: "sag_mill.csv".to_string(),
            target_names: vec!["current".to_string(), "weight".to_string()],
            input_channels: 12,
            num_parameters: 1234,
            epochs_run: 3,
            best_epoch: 2,
            best_val_loss: 0.31,
            test_loss: 0.35,
            train_loss_history: vec![0.5, 0.4, 0.35],
            val_loss_history: vec![0.45, 0.31, 0.33],
            finished_at: chrono::Utc::now().to_rfc3339(),
        };

        let path = std::env::temp_dir().join("sagmill_summary_test.json");
        export_summary_json(&summary, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: RunSummary = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.best_epoch, 2);
        assert_eq!(parsed.val_loss_history.len(), 3);

        std::fs::remove_file(path).ok();
    }
}
