// projeto: sagmilltrain
// file: src/neural/metrics.rs
// Training metrics, early-stopping tracker and HTML plots

use std::path::Path;

use plotly::{Layout, Plot, Scatter};
use serde::{Deserialize, Serialize};

use crate::neural::utils::TrainingError;

/// Per-epoch record. The two forecast targets keep their own regression
/// metrics: `current_*` is the main motor current, `weight_*` the mill weight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub current_rmse: f64,
    pub current_mae: f64,
    pub current_r2: f64,
    pub weight_rmse: f64,
    pub weight_mae: f64,
    pub weight_r2: f64,
    pub timestamp: String,
}

#[derive(Debug, Clone)]
pub struct MetricsTracker {
    pub history: Vec<TrainingMetrics>,
    pub best_val_loss: f64,
    pub best_epoch: usize,
    pub patience_counter: usize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        MetricsTracker {
            history: Vec::new(),
            best_val_loss: f64::INFINITY,
            best_epoch: 0,
            patience_counter: 0,
        }
    }

    /// Records an epoch and returns true when training should stop early.
    pub fn add_metrics(&mut self, metrics: TrainingMetrics, patience: usize) -> bool {
        let is_best = metrics.val_loss < self.best_val_loss;

        if is_best {
            self.best_val_loss = metrics.val_loss;
            self.best_epoch = metrics.epoch;
            self.patience_counter = 0;
            println!(
                "🎯 [Metrics] New best validation loss: {:.6} at epoch {}",
                self.best_val_loss, self.best_epoch
            );
        } else {
            self.patience_counter += 1;
        }

        self.history.push(metrics);

        self.patience_counter >= patience
    }

    pub fn is_best_epoch(&self) -> bool {
        self.patience_counter == 0 && !self.history.is_empty()
    }

    pub fn get_best_metrics(&self) -> Option<&TrainingMetrics> {
        self.history
            .iter()
            .min_by(|a, b| a.val_loss.partial_cmp(&b.val_loss).unwrap())
    }

    pub fn get_latest_metrics(&self) -> Option<&TrainingMetrics> {
        self.history.last()
    }

    pub fn train_loss_history(&self) -> Vec<f64> {
        self.history.iter().map(|m| m.train_loss).collect()
    }

    pub fn val_loss_history(&self) -> Vec<f64> {
        self.history.iter().map(|m| m.val_loss).collect()
    }

    pub fn print_summary(&self) {
        if let Some(best) = self.get_best_metrics() {
            println!("📈 [Metrics] Training Summary:");
            println!("   ├── Best Epoch: {}", best.epoch);
            println!("   ├── Best Val Loss: {:.6}", best.val_loss);
            println!("   ├── Motor Current RMSE: {:.6}", best.current_rmse);
            println!("   ├── Motor Current MAE: {:.6}", best.current_mae);
            println!("   ├── Motor Current R²: {:.6}", best.current_r2);
            println!("   ├── Mill Weight RMSE: {:.6}", best.weight_rmse);
            println!("   ├── Mill Weight MAE: {:.6}", best.weight_mae);
            println!("   └── Mill Weight R²: {:.6}", best.weight_r2);
        }
    }

    pub fn save_to_csv(&self, file_path: &str) -> Result<(), std::io::Error> {
        use std::fs::File;
        use std::io::Write;

        let mut file = File::create(file_path)?;

        writeln!(
            file,
            "epoch,train_loss,val_loss,learning_rate,current_rmse,current_mae,current_r2,weight_rmse,weight_mae,weight_r2,timestamp"
        )?;

        for metrics in &self.history {
            writeln!(
                file,
                "{},{:.6},{:.6},{:.8},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{}",
                metrics.epoch,
                metrics.train_loss,
                metrics.val_loss,
                metrics.learning_rate,
                metrics.current_rmse,
                metrics.current_mae,
                metrics.current_r2,
                metrics.weight_rmse,
                metrics.weight_mae,
                metrics.weight_r2,
                metrics.timestamp
            )?;
        }

        println!("📊 [Metrics] Training history saved to: {}", file_path);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub rmse: f64,
    pub mae: f64,
    pub r_squared: f64,
    pub max_error: f64,
    pub n_samples: usize,
}

impl RegressionMetrics {
    pub fn print(&self, prefix: &str) {
        println!("📊 [{}] Regression Metrics:", prefix);
        println!("   ├── Samples: {}", self.n_samples);
        println!("   ├── RMSE: {:.6}", self.rmse);
        println!("   ├── MAE: {:.6}", self.mae);
        println!("   ├── Max Error: {:.6}", self.max_error);
        println!("   └── R²: {:.6}", self.r_squared);
    }
}

/// Standard regression metrics over one target channel.
pub fn calculate_regression_metrics(predictions: &[f64], targets: &[f64]) -> RegressionMetrics {
    assert_eq!(
        predictions.len(),
        targets.len(),
        "Predictions and targets must have same length"
    );

    let n = predictions.len() as f64;

    let mse = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (p - t).powi(2))
        .sum::<f64>()
        / n;
    let rmse = mse.sqrt();

    let mae = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (p - t).abs())
        .sum::<f64>()
        / n;

    let target_mean = targets.iter().sum::<f64>() / n;
    let ss_res = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (t - p).powi(2))
        .sum::<f64>();
    let ss_tot = targets.iter().map(|t| (t - target_mean).powi(2)).sum::<f64>();
    let r_squared = if ss_tot != 0.0 { 1.0 - (ss_res / ss_tot) } else { 0.0 };

    let max_error = predictions
        .iter()
        .zip(targets.iter())
        .map(|(p, t)| (p - t).abs())
        .fold(0.0, |acc: f64, x| acc.max(x));

    RegressionMetrics {
        mse,
        rmse,
        mae,
        r_squared,
        max_error,
        n_samples: predictions.len(),
    }
}

/// Writes the train/validation loss curves as a standalone HTML plot.
pub fn save_loss_plot<P: AsRef<Path>>(
    train_losses: &[f64],
    val_losses: &[f64],
    path: P,
) -> Result<(), TrainingError> {
    let mut plot = Plot::new();
    let epochs: Vec<usize> = (1..=train_losses.len()).collect();

    let trace_train = Scatter::new(epochs.clone(), train_losses.to_vec())
        .name("Training Loss")
        .mode(plotly::common::Mode::Lines);
    let trace_val = Scatter::new(epochs, val_losses.to_vec())
        .name("Validation Loss")
        .mode(plotly::common::Mode::Lines);

    plot.add_trace(trace_train);
    plot.add_trace(trace_val);

    let layout = Layout::new()
        .title("SAG Mill Forecast Training and Validation Loss")
        .x_axis(plotly::layout::Axis::new().title("Epoch"))
        .y_axis(plotly::layout::Axis::new().title("MAE (normalized)"));
    plot.set_layout(layout);

    plot.write_html(path.as_ref());
    println!("📊 [Metrics] Loss plot saved to: {}", path.as_ref().display());
    Ok(())
}

/// Writes one raw sensor channel over time as a standalone HTML plot.
pub fn save_series_plot<P: AsRef<Path>>(
    series_name: &str,
    values: &[f64],
    path: P,
) -> Result<(), TrainingError> {
    let mut plot = Plot::new();
    let steps: Vec<usize> = (0..values.len()).collect();

    let trace = Scatter::new(steps, values.to_vec())
        .name(series_name)
        .mode(plotly::common::Mode::Lines);
    plot.add_trace(trace);

    let layout = Layout::new()
        .title(series_name)
        .x_axis(plotly::layout::Axis::new().title("Timestep"))
        .y_axis(plotly::layout::Axis::new().title(series_name));
    plot.set_layout(layout);

    plot.write_html(path.as_ref());
    println!("📊 [Metrics] Series plot saved to: {}", path.as_ref().display());
    Ok(())
}
