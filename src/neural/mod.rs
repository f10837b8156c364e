// projeto: sagmilltrain
// file: src/neural/mod.rs
// Module declarations for the SAG mill forecasting trainer

pub mod utils;    // Error handling, optimizer, schedulers and config
pub mod storage;  // Checkpoint and run-summary persistence on disk
pub mod metrics;  // Training metrics, early-stopping tracker and plots
pub mod model;    // Stacked LSTM regressor with BPTT
pub mod data;     // Sensor CSV loading, normalization and windowing

// Re-export commonly used items for convenience
pub use model::{Activation, MillLstm, MillLstmConfig, ModelWeights};
pub use metrics::{MetricsTracker, TrainingMetrics};
pub use utils::{PlateauScheduler, RmsPropOptimizer, TrainConfig, TrainingError};
pub use data::{ColumnStats, SensorFrame, WindowBatches};
pub use storage::{load_checkpoint, save_checkpoint};
