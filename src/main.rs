// projeto: sagmilltrain
// file: src/main.rs
// Main entry point for the SAG mill sensor forecasting trainer

mod neural;

use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use log::{debug, error, info, warn};

use crate::neural::data::{self, SensorFrame, WindowBatches};
use crate::neural::metrics::{
    MetricsTracker, TrainingMetrics, calculate_regression_metrics, save_loss_plot,
    save_series_plot,
};
use crate::neural::model::{Activation, MillLstm, MillLstmConfig, ModelWeights};
use crate::neural::storage::{RunSummary, export_summary_json, save_checkpoint};
use crate::neural::utils::{
    PlateauScheduler, RmsPropOptimizer, TrainConfig, TrainingError, validate_input_data,
};

#[derive(Parser, Debug)]
#[command(
    name = "sagmill-train",
    version = "0.1.0",
    about = "LSTM trainer forecasting SAG mill motor current and mill weight from sensor logs",
    long_about = "Trains a stacked LSTM regressor on a multivariate sensor CSV to forecast \
the mill's main motor current and mill weight a fixed number of timesteps ahead. \
Writes checkpoints, training history and HTML plots."
)]
struct Cli {
    /// Sensor CSV (rows are timestamps, columns are sensor channels)
    #[arg(long, default_value = "sag_mill.csv")]
    csv: PathBuf,

    /// Header name of the motor current channel
    #[arg(long, default_value = "Mill main drive - Main motor current")]
    target_current: String,

    /// Header name of the mill weight channel
    #[arg(long, default_value = "Mill weight")]
    target_weight: String,

    /// TOML file replacing all hyperparameter flags below
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for checkpoints, history and plots
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Lookback window in timesteps
    #[arg(long, default_value_t = 60 * 24, help = "Timesteps of history per window")]
    lookback: usize,

    /// Subsampling stride inside the window
    #[arg(long, default_value_t = 1)]
    step: usize,

    /// Forecast horizon in timesteps
    #[arg(long, default_value_t = 10, help = "How far ahead the targets sit")]
    delay: usize,

    /// Windows per batch
    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Training batches per epoch
    #[arg(long, default_value_t = 500)]
    steps_per_epoch: usize,

    /// Maximum number of epochs
    #[arg(long, default_value_t = 50)]
    epochs: usize,

    /// LSTM layer sizes, comma separated
    #[arg(long, value_delimiter = ',', default_value = "32,64")]
    hidden_sizes: Vec<usize>,

    /// Input dropout rate per layer
    #[arg(long, default_value_t = 0.1, help = "Dropout on layer inputs (0.0-1.0)")]
    dropout: f64,

    /// Recurrent dropout rate per layer
    #[arg(long, default_value_t = 0.5, help = "Dropout on recurrent state (0.0-1.0)")]
    recurrent_dropout: f64,

    /// Initial learning rate
    #[arg(long, default_value_t = 0.001, help = "Learning rate for RMSProp")]
    learning_rate: f64,

    /// Norm bound for gradient clipping
    #[arg(long, default_value_t = 5.0)]
    clip_norm: f64,

    /// Early stopping patience
    #[arg(long, default_value_t = 10, help = "Epochs without improvement before stopping")]
    patience: usize,

    /// Learning rate reduction factor on plateau
    #[arg(long, default_value_t = 0.1)]
    plateau_factor: f64,

    /// Epochs without improvement before reducing the learning rate
    #[arg(long, default_value_t = 10)]
    plateau_patience: usize,

    /// Learning rate floor
    #[arg(long, default_value_t = 1e-6)]
    min_lr: f64,

    /// Last row index of the training range
    #[arg(long, default_value_t = 300_000)]
    train_end: usize,

    /// Last row index of the validation range
    #[arg(long, default_value_t = 400_000)]
    val_end: usize,

    /// Checkpoint frequency in epochs
    #[arg(long, default_value_t = 10)]
    save_freq: usize,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<(), TrainingError> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let start_time = Instant::now();
    info!("🚀 SAG mill forecasting trainer started");
    info!("🕐 Started at: {}", Utc::now().format("%Y-%m-%d %H:%M:%S"));

    let config = resolve_config(&cli)?;
    config.validate()?;
    info!(
        "📊 Lookback: {} | Step: {} | Delay: {} | Hidden: {:?} | Batch: {}",
        config.lookback, config.step, config.delay, config.hidden_sizes, config.batch_size
    );

    match run_training(&cli, &config) {
        Ok(_) => {
            info!(
                "✅ Training finished successfully in {:.2}s",
                start_time.elapsed().as_secs_f64()
            );
            Ok(())
        }
        Err(e) => {
            error!("❌ Training failed: {}", e);
            std::process::exit(1);
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_secs()
        .init();
}

fn resolve_config(cli: &Cli) -> Result<TrainConfig, TrainingError> {
    if let Some(path) = &cli.config {
        info!(
            "🔧 Loading hyperparameters from {} (hyperparameter flags are ignored)",
            path.display()
        );
        return TrainConfig::from_file(path);
    }

    let mut config = TrainConfig::default();
    config.lookback = cli.lookback;
    config.step = cli.step;
    config.delay = cli.delay;
    config.batch_size = cli.batch_size;
    config.steps_per_epoch = cli.steps_per_epoch;
    config.epochs = cli.epochs;
    config.hidden_sizes = cli.hidden_sizes.clone();
    config.dropout = cli.dropout;
    config.recurrent_dropout = cli.recurrent_dropout;
    config.learning_rate = cli.learning_rate;
    config.clip_norm = cli.clip_norm;
    config.patience = cli.patience;
    config.plateau_factor = cli.plateau_factor;
    config.plateau_patience = cli.plateau_patience;
    config.min_lr = cli.min_lr;
    config.train_end = cli.train_end;
    config.val_end = cli.val_end;
    config.save_freq = cli.save_freq;
    Ok(config)
}

/// Tanh cells throughout, relu on the top layer.
fn layer_activations(num_layers: usize) -> Vec<Activation> {
    let mut activations = vec![Activation::Tanh; num_layers];
    if let Some(last) = activations.last_mut() {
        *last = Activation::Relu;
    }
    activations
}

/// Shrinks the configured train/validation split to fit a smaller table,
/// keeping the 60/20/20 proportions of the configured ranges.
fn fit_splits(config: &TrainConfig, n_rows: usize) -> (usize, usize) {
    if config.val_end + config.delay + 1 <= n_rows {
        return (config.train_end, config.val_end);
    }
    let usable = n_rows.saturating_sub(config.delay + 1);
    let train_end = usable * 3 / 5;
    let val_end = usable * 4 / 5;
    warn!(
        "⚠️ Table has {} rows, below the configured split; using train_end={} val_end={}",
        n_rows, train_end, val_end
    );
    (train_end, val_end)
}

fn run_training(cli: &Cli, config: &TrainConfig) -> Result<(), TrainingError> {
    std::fs::create_dir_all(&cli.output_dir)?;

    let mut frame = data::load_sensor_csv(&cli.csv)?;
    let targets = data::target_indices(&frame, &cli.target_current, &cli.target_weight)?;
    info!(
        "🎯 Targets: '{}' (column {}) and '{}' (column {})",
        cli.target_current, targets[0], cli.target_weight, targets[1]
    );

    plot_raw_targets(cli, &frame, targets)?;

    validate_input_data(&frame.values, "sensor table")?;
    let stats = data::normalize(&mut frame)?;
    info!("✅ Normalized {} channels", frame.num_channels());

    let (train_end, val_end) = fit_splits(config, frame.num_rows());

    let mut train_gen = WindowBatches::new(
        &frame.values,
        targets,
        config.lookback,
        config.delay,
        None,
        Some(train_end),
        false,
        config.batch_size,
        config.step,
    )?;
    let mut val_gen = WindowBatches::new(
        &frame.values,
        targets,
        config.lookback,
        config.delay,
        Some(train_end + 1),
        Some(val_end),
        false,
        config.batch_size,
        config.step,
    )?;

    let val_steps = (val_end - (train_end + 1))
        .checked_sub(config.lookback)
        .map(|span| span / config.batch_size)
        .filter(|&steps| steps > 0)
        .ok_or_else(|| {
            TrainingError::DataProcessing(format!(
                "validation range ({}, {}] too small for lookback {}",
                train_end, val_end, config.lookback
            ))
        })?;
    info!(
        "✅ Splits - Train: [0, {}) | Val: ({}, {}] ({} steps) | Test: rest",
        train_end, train_end, val_end, val_steps
    );

    let model_config = MillLstmConfig {
        input_dim: frame.num_channels(),
        hidden_sizes: config.hidden_sizes.clone(),
        activations: layer_activations(config.hidden_sizes.len()),
        output_dim: 2,
        dropout: config.dropout,
        recurrent_dropout: config.recurrent_dropout,
    };
    let mut model = MillLstm::new(model_config)?;
    info!("🛠️ Model created with {} parameters", model.num_parameters());

    let mut optimizer = RmsPropOptimizer::new(config.learning_rate, config.rho, config.epsilon);
    let mut scheduler =
        PlateauScheduler::new(config.plateau_factor, config.plateau_patience, config.min_lr);
    let mut tracker = MetricsTracker::new();
    let mut best_val_loss = f64::INFINITY;
    let mut epochs_run = 0;

    info!("🎓 Training for up to {} epochs", config.epochs);
    for epoch in 1..=config.epochs {
        let epoch_start = Instant::now();
        epochs_run = epoch;

        let mut train_loss_sum = 0.0;
        for _ in 0..config.steps_per_epoch {
            let batch = train_gen.next_batch();
            train_loss_sum += model.train_batch(&batch.x, &batch.y, &mut optimizer, config.clip_norm)?;
        }
        let train_loss = train_loss_sum / config.steps_per_epoch as f64;

        let (val_loss, val_report) = validation_sweep(&model, &mut val_gen, val_steps)?;

        let epoch_time = epoch_start.elapsed().as_secs_f64();
        info!(
            "📈 Epoch {}/{}: Train={:.6} | Val={:.6} | Current RMSE={:.4} | Weight RMSE={:.4} | {:.1}s",
            epoch, config.epochs, train_loss, val_loss, val_report.current.rmse,
            val_report.weight.rmse, epoch_time
        );

        let metrics = TrainingMetrics {
            epoch,
            train_loss,
            val_loss,
            learning_rate: optimizer.learning_rate,
            current_rmse: val_report.current.rmse,
            current_mae: val_report.current.mae,
            current_r2: val_report.current.r_squared,
            weight_rmse: val_report.weight.rmse,
            weight_mae: val_report.weight.mae,
            weight_r2: val_report.weight.r_squared,
            timestamp: Utc::now().to_rfc3339(),
        };
        let should_stop = tracker.add_metrics(metrics, config.patience);

        if let Some(new_lr) = scheduler.step(val_loss, optimizer.learning_rate) {
            optimizer.set_learning_rate(new_lr);
            info!("📉 Validation loss plateaued; learning rate reduced to {:.8}", new_lr);
        }

        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            let weights = snapshot(&model, config, cli, &stats, epoch, val_loss);
            save_checkpoint(&weights, cli.output_dir.join("sagmill_lstm_best.bin"))?;
        } else if epoch % config.save_freq == 0 {
            debug!("💾 Periodic checkpoint at epoch {}", epoch);
            let weights = snapshot(&model, config, cli, &stats, epoch, val_loss);
            save_checkpoint(&weights, cli.output_dir.join("sagmill_lstm_latest.bin"))?;
        }

        if should_stop {
            info!("⏹️ Early stopping triggered at epoch {}", epoch);
            break;
        }
    }

    tracker.print_summary();

    // Held-out range after val_end, evaluated once.
    let test_loss = test_evaluation(&frame, targets, config, val_end, &model)?;

    save_loss_plot(
        &tracker.train_loss_history(),
        &tracker.val_loss_history(),
        cli.output_dir.join("loss.html"),
    )?;
    let history_path = cli.output_dir.join("training_history.csv");
    tracker.save_to_csv(&history_path.to_string_lossy())?;

    let summary = RunSummary {
        csv_path: cli.csv.to_string_lossy().to_string(),
        target_names: vec![cli.target_current.clone(), cli.target_weight.clone()],
        input_channels: frame.num_channels(),
        num_parameters: model.num_parameters(),
        epochs_run,
        best_epoch: tracker.best_epoch,
        best_val_loss: tracker.best_val_loss,
        test_loss,
        train_loss_history: tracker.train_loss_history(),
        val_loss_history: tracker.val_loss_history(),
        finished_at: Utc::now().to_rfc3339(),
    };
    export_summary_json(&summary, cli.output_dir.join("run_summary.json"))?;

    Ok(())
}

fn plot_raw_targets(
    cli: &Cli,
    frame: &SensorFrame,
    targets: [usize; 2],
) -> Result<(), TrainingError> {
    debug!("📊 Plotting raw target series");
    save_series_plot(
        &cli.target_current,
        &data::channel_series(frame, targets[0]),
        cli.output_dir.join("motor_current.html"),
    )?;
    save_series_plot(
        &cli.target_weight,
        &data::channel_series(frame, targets[1]),
        cli.output_dir.join("mill_weight.html"),
    )?;
    Ok(())
}

struct TargetReport {
    current: crate::neural::metrics::RegressionMetrics,
    weight: crate::neural::metrics::RegressionMetrics,
}

fn validation_sweep(
    model: &MillLstm,
    val_gen: &mut WindowBatches<'_>,
    val_steps: usize,
) -> Result<(f64, TargetReport), TrainingError> {
    let mut loss_sum = 0.0;
    let mut pred_current = Vec::new();
    let mut pred_weight = Vec::new();
    let mut true_current = Vec::new();
    let mut true_weight = Vec::new();

    for _ in 0..val_steps {
        let batch = val_gen.next_batch();
        let (loss, predictions) = model.evaluate(&batch.x, &batch.y)?;
        loss_sum += loss;

        for row in 0..predictions.nrows() {
            pred_current.push(predictions[[row, 0]]);
            pred_weight.push(predictions[[row, 1]]);
            true_current.push(batch.y[[row, 0]]);
            true_weight.push(batch.y[[row, 1]]);
        }
    }

    let report = TargetReport {
        current: calculate_regression_metrics(&pred_current, &true_current),
        weight: calculate_regression_metrics(&pred_weight, &true_weight),
    };
    Ok((loss_sum / val_steps as f64, report))
}

fn test_evaluation(
    frame: &SensorFrame,
    targets: [usize; 2],
    config: &TrainConfig,
    val_end: usize,
    model: &MillLstm,
) -> Result<f64, TrainingError> {
    let mut test_gen = match WindowBatches::new(
        &frame.values,
        targets,
        config.lookback,
        config.delay,
        Some(val_end + 1),
        None,
        false,
        config.batch_size,
        config.step,
    ) {
        Ok(generator) => generator,
        Err(e) => {
            warn!("⚠️ Skipping test evaluation: {}", e);
            return Ok(f64::NAN);
        }
    };

    let test_steps = test_gen.steps_per_sweep().max(1);
    info!("🧪 Evaluating on the test range ({} steps)", test_steps);

    let (test_loss, report) = validation_sweep(model, &mut test_gen, test_steps)?;
    report.current.print("Test - Motor Current");
    report.weight.print("Test - Mill Weight");
    info!("🧪 Test MAE (normalized): {:.6}", test_loss);
    Ok(test_loss)
}

fn snapshot(
    model: &MillLstm,
    config: &TrainConfig,
    cli: &Cli,
    stats: &data::ColumnStats,
    epoch: usize,
    val_loss: f64,
) -> ModelWeights {
    let mut weights = model.get_weights();
    weights.lookback = config.lookback;
    weights.step = config.step;
    weights.delay = config.delay;
    weights.target_names = vec![cli.target_current.clone(), cli.target_weight.clone()];
    weights.stats = Some(stats.clone());
    weights.epoch = epoch;
    weights.val_loss = val_loss;
    weights.timestamp = Utc::now().to_rfc3339();
    weights
}


// Example usage commands:
// cargo run --release -- --csv sag_mill.csv --verbose
// cargo run --release -- --csv sag_mill.csv --lookback 720 --step 6 --epochs 20
// cargo run --release -- --config train.toml --output-dir runs/plateau
// cargo run --release -- --hidden-sizes 64,64 --dropout 0.2 --recurrent-dropout 0.3
