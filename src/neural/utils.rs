// projeto: sagmilltrain
// file: src/neural/utils.rs
// Utility functions, optimizer, schedulers, and error handling

use ndarray::{Array, Array1, Array2, ArrayD, Dimension, ShapeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Data processing error: {0}")]
    DataProcessing(String),

    #[error("Model configuration error: {0}")]
    ModelConfiguration(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),
}

/// RMSProp with one accumulator per named parameter.
#[derive(Debug, Clone)]
pub struct RmsPropOptimizer {
    pub learning_rate: f64,
    pub rho: f64,
    pub epsilon: f64,
    cache: HashMap<String, ArrayD<f64>>,
}

impl RmsPropOptimizer {
    pub fn new(learning_rate: f64, rho: f64, epsilon: f64) -> Self {
        RmsPropOptimizer {
            learning_rate,
            rho,
            epsilon,
            cache: HashMap::new(),
        }
    }

    pub fn set_learning_rate(&mut self, new_lr: f64) {
        self.learning_rate = new_lr;
    }

    /// Returns the update to subtract from the parameter.
    pub fn update<D: Dimension>(&mut self, param_name: &str, gradient: &Array<f64, D>) -> Array<f64, D> {
        let rho = self.rho;
        let cache = self
            .cache
            .entry(param_name.to_string())
            .or_insert_with(|| ArrayD::zeros(gradient.raw_dim().into_dyn()));

        cache.zip_mut_with(gradient, |c, &g| *c = rho * *c + (1.0 - rho) * g * g);

        let lr = self.learning_rate;
        let eps = self.epsilon;
        let mut update = gradient.to_owned();
        update.zip_mut_with(cache, |u, &c| *u = lr * *u / (c.sqrt() + eps));
        update
    }

    pub fn reset(&mut self) {
        self.cache.clear();
    }
}

/// Learning-rate reduction when the validation loss stops improving.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
    pub min_delta: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(factor: f64, patience: usize, min_lr: f64) -> Self {
        PlateauScheduler {
            factor,
            patience,
            min_lr,
            min_delta: 1e-8,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// Feed the epoch's validation loss; returns the new learning rate when a
    /// reduction is due.
    pub fn step(&mut self, val_loss: f64, current_lr: f64) -> Option<f64> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            self.wait = 0;
            let new_lr = (current_lr * self.factor).max(self.min_lr);
            if new_lr < current_lr {
                return Some(new_lr);
            }
        }
        None
    }
}

pub fn sigmoid(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|val| 1.0 / (1.0 + (-val).exp()))
}

pub fn tanh(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|val| val.tanh())
}

pub fn relu(x: &Array1<f64>) -> Array1<f64> {
    x.mapv(|val| val.max(0.0))
}

/// Derivative of the sigmoid expressed through its output value.
pub fn sigmoid_deriv_from_value(s: &Array1<f64>) -> Array1<f64> {
    s.mapv(|v| v * (1.0 - v))
}

pub fn validate_input_data(data: &Array2<f64>, name: &str) -> Result<(), TrainingError> {
    if data.is_empty() {
        return Err(TrainingError::DataProcessing(format!("{} is empty", name)));
    }

    for (i, row) in data.axis_iter(ndarray::Axis(0)).enumerate() {
        for (j, &value) in row.iter().enumerate() {
            if value.is_nan() {
                return Err(TrainingError::DataProcessing(format!(
                    "{} contains NaN at position ({}, {})",
                    name, i, j
                )));
            }
            if value.is_infinite() {
                return Err(TrainingError::DataProcessing(format!(
                    "{} contains infinite value at position ({}, {})",
                    name, i, j
                )));
            }
        }
    }

    Ok(())
}

pub fn validate_targets(targets: &[f64], name: &str) -> Result<(), TrainingError> {
    if targets.is_empty() {
        return Err(TrainingError::DataProcessing(format!("{} is empty", name)));
    }

    for (i, &value) in targets.iter().enumerate() {
        if !value.is_finite() {
            return Err(TrainingError::DataProcessing(format!(
                "{} contains non-finite value at position {}",
                name, i
            )));
        }
    }

    Ok(())
}

/// Hyperparameters of a training run. Can be loaded from a TOML file with
/// `--config`; otherwise assembled from the CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub lookback: usize,
    pub step: usize,
    pub delay: usize,
    pub batch_size: usize,
    pub steps_per_epoch: usize,
    pub epochs: usize,
    pub hidden_sizes: Vec<usize>,
    pub dropout: f64,
    pub recurrent_dropout: f64,
    pub learning_rate: f64,
    pub rho: f64,
    pub epsilon: f64,
    pub clip_norm: f64,
    pub patience: usize,
    pub plateau_factor: f64,
    pub plateau_patience: usize,
    pub min_lr: f64,
    pub train_end: usize,
    pub val_end: usize,
    pub save_freq: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            lookback: 60 * 24,
            step: 1,
            delay: 10,
            batch_size: 128,
            steps_per_epoch: 500,
            epochs: 50,
            hidden_sizes: vec![32, 64],
            dropout: 0.1,
            recurrent_dropout: 0.5,
            learning_rate: 0.001,
            rho: 0.9,
            epsilon: 1e-7,
            clip_norm: 5.0,
            patience: 10,
            plateau_factor: 0.1,
            plateau_patience: 10,
            min_lr: 1e-6,
            train_end: 300_000,
            val_end: 400_000,
            save_freq: 10,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: &Path) -> Result<Self, TrainingError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| TrainingError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.hidden_sizes.is_empty() {
            return Err(TrainingError::ModelConfiguration(
                "at least one hidden layer size is required".to_string(),
            ));
        }
        if self.step == 0 {
            return Err(TrainingError::ModelConfiguration("step must be >= 1".to_string()));
        }
        if self.lookback == 0 || self.lookback % self.step != 0 {
            return Err(TrainingError::ModelConfiguration(format!(
                "lookback {} must be a positive multiple of step {}",
                self.lookback, self.step
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainingError::ModelConfiguration("batch_size must be >= 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) || !(0.0..1.0).contains(&self.recurrent_dropout) {
            return Err(TrainingError::ModelConfiguration(
                "dropout rates must be in [0.0, 1.0)".to_string(),
            ));
        }
        if self.train_end >= self.val_end {
            return Err(TrainingError::ModelConfiguration(format!(
                "train_end {} must be below val_end {}",
                self.train_end, self.val_end
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    #[test]
    fn test_rmsprop_update() {
        let mut optimizer = RmsPropOptimizer::new(0.001, 0.9, 1e-7);
        let gradient = Array1::from_vec(vec![0.1, -0.2, 0.3]);
        let update = optimizer.update("test_param", &gradient);

        assert_eq!(update.len(), 3);
        // Updates point in the gradient direction.
        for (u, g) in update.iter().zip(gradient.iter()) {
            assert_eq!(u.signum(), g.signum());
        }

        let matrix_grad = Array2::from_shape_vec((2, 2), vec![1.0, -1.0, 0.5, -0.5]).unwrap();
        let matrix_update = optimizer.update("test_matrix", &matrix_grad);
        assert_eq!(matrix_update.dim(), (2, 2));

        optimizer.set_learning_rate(0.01);
        assert_eq!(optimizer.learning_rate, 0.01);
    }

    #[test]
    fn test_rmsprop_accumulator_shrinks_steps() {
        let mut optimizer = RmsPropOptimizer::new(0.001, 0.9, 1e-7);
        let gradient = Array1::from_vec(vec![1.0]);
        let first = optimizer.update("w", &gradient)[0];
        let second = optimizer.update("w", &gradient)[0];
        // Accumulator grows with repeated equal gradients, so steps shrink.
        assert!(second < first);
    }

    #[test]
    fn test_plateau_scheduler() {
        let mut scheduler = PlateauScheduler::new(0.1, 2, 1e-6);
        assert_eq!(scheduler.step(1.0, 0.01), None);
        assert_eq!(scheduler.step(0.9, 0.01), None); // improvement
        assert_eq!(scheduler.step(0.95, 0.01), None); // wait = 1
        let reduced = scheduler.step(0.95, 0.01); // wait = 2 -> reduce
        assert!(reduced.is_some());
        assert!((reduced.unwrap() - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_plateau_scheduler_respects_min_lr() {
        let mut scheduler = PlateauScheduler::new(0.1, 1, 1e-3);
        scheduler.step(1.0, 1e-3);
        assert_eq!(scheduler.step(1.0, 1e-3), None);
    }

    #[test]
    fn test_activation_functions() {
        let x = Array1::from_vec(vec![-1.0, 0.0, 1.0]);
        let sig_result = sigmoid(&x);
        assert!(sig_result[0] < 0.5);
        assert!((sig_result[1] - 0.5).abs() < 1e-10);
        assert!(sig_result[2] > 0.5);
        let tanh_result = tanh(&x);
        assert!(tanh_result[0] < 0.0);
        assert!(tanh_result[1].abs() < 1e-10);
        assert!(tanh_result[2] > 0.0);
        let relu_result = relu(&x);
        assert_eq!(relu_result[0], 0.0);
        assert_eq!(relu_result[1], 0.0);
        assert_eq!(relu_result[2], 1.0);
    }

    #[test]
    fn test_data_validation() {
        let valid_data = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(validate_input_data(&valid_data, "test").is_ok());
        let invalid_data = Array2::from_shape_vec((2, 2), vec![1.0, f64::NAN, 3.0, 4.0]).unwrap();
        assert!(validate_input_data(&invalid_data, "test").is_err());
        let valid_targets = vec![1.0, 2.0, 3.0];
        assert!(validate_targets(&valid_targets, "test").is_ok());
        let invalid_targets = vec![1.0, f64::INFINITY, 3.0];
        assert!(validate_targets(&invalid_targets, "test").is_err());
    }

    #[test]
    fn test_train_config_from_toml() {
        let dir = std::env::temp_dir().join("sagmilltrain_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("train.toml");
        std::fs::write(&path, "lookback = 240\nstep = 2\nepochs = 5\nhidden_sizes = [16, 8]\n").unwrap();

        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.lookback, 240);
        assert_eq!(config.step, 2);
        assert_eq!(config.epochs, 5);
        assert_eq!(config.hidden_sizes, vec![16, 8]);
        // Unspecified fields keep their defaults.
        assert_eq!(config.batch_size, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_train_config_validation() {
        let mut config = TrainConfig::default();
        config.lookback = 7;
        config.step = 2;
        assert!(config.validate().is_err());

        let mut config = TrainConfig::default();
        config.train_end = 500_000;
        assert!(config.validate().is_err());
    }
}
