// projeto: sagmilltrain
// file: src/neural/data.rs
// Sensor log loading, normalization, and sliding-window batch generation

use log::{debug, info, warn};
use ndarray::{Array2, Array3, s};
use ndarray_stats::QuantileExt;
use rand::Rng;
use rand::rngs::ThreadRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::neural::utils::TrainingError;

/// Tabular sensor log: rows are timestamps, columns are sensor channels.
#[derive(Debug, Clone)]
pub struct SensorFrame {
    pub column_names: Vec<String>,
    pub values: Array2<f64>,
}

impl SensorFrame {
    pub fn num_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn num_channels(&self) -> usize {
        self.values.ncols()
    }

    /// Resolve a sensor channel by its CSV header name.
    pub fn column_index(&self, name: &str) -> Result<usize, TrainingError> {
        self.column_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| {
                TrainingError::DataProcessing(format!(
                    "unknown sensor channel '{}'; available: {}",
                    name,
                    self.column_names.join(", ")
                ))
            })
    }

    pub fn column(&self, index: usize) -> ndarray::ArrayView1<'_, f64> {
        self.values.column(index)
    }
}

/// Per-channel statistics captured before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStats {
    pub column_names: Vec<String>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    pub min_values: Vec<f64>,
    pub max_values: Vec<f64>,
}

/// Loads the sensor CSV. The `time` column is dropped, empty cells count as
/// missing, and any row with a missing or unparseable value is discarded.
pub fn load_sensor_csv(path: &Path) -> Result<SensorFrame, TrainingError> {
    info!("📥 [Data] Loading sensor log from {}", path.display());

    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let kept_columns: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, h)| h.trim() != "time")
        .map(|(idx, _)| idx)
        .collect();

    if kept_columns.is_empty() {
        return Err(TrainingError::DataProcessing(
            "CSV has no sensor channels besides the time column".to_string(),
        ));
    }

    let column_names: Vec<String> = kept_columns
        .iter()
        .map(|&idx| headers[idx].trim().to_string())
        .collect();

    let mut buffer: Vec<f64> = Vec::new();
    let mut kept_rows = 0usize;
    let mut dropped_rows = 0usize;

    for record in reader.records() {
        let record = record?;
        let mut row: Vec<f64> = Vec::with_capacity(kept_columns.len());
        let mut complete = true;

        for &idx in &kept_columns {
            let cell = record.get(idx).map(str::trim).unwrap_or("");
            match cell.parse::<f64>() {
                Ok(v) if v.is_finite() => row.push(v),
                _ => {
                    complete = false;
                    break;
                }
            }
        }

        if complete {
            buffer.extend_from_slice(&row);
            kept_rows += 1;
        } else {
            dropped_rows += 1;
        }
    }

    if kept_rows == 0 {
        return Err(TrainingError::DataProcessing(format!(
            "no complete rows in {}",
            path.display()
        )));
    }
    if dropped_rows > 0 {
        warn!("⚠️ [Data] Dropped {} incomplete rows", dropped_rows);
    }

    let values = Array2::from_shape_vec((kept_rows, kept_columns.len()), buffer)?;
    info!(
        "✅ [Data] Loaded {} rows x {} channels",
        kept_rows,
        kept_columns.len()
    );

    Ok(SensorFrame {
        column_names,
        values,
    })
}

/// Z-score normalization in place, one mean/std per channel over the whole
/// table. Channels with near-zero variance end up centered at zero.
pub fn normalize(frame: &mut SensorFrame) -> Result<ColumnStats, TrainingError> {
    let n_rows = frame.num_rows();
    if n_rows == 0 {
        return Err(TrainingError::DataProcessing("cannot normalize an empty frame".to_string()));
    }

    let mut means = Vec::with_capacity(frame.num_channels());
    let mut stds = Vec::with_capacity(frame.num_channels());
    let mut min_values = Vec::with_capacity(frame.num_channels());
    let mut max_values = Vec::with_capacity(frame.num_channels());

    for col in 0..frame.num_channels() {
        let column = frame.values.column(col);

        let min_val = *column
            .min()
            .map_err(|e| TrainingError::DataProcessing(format!("min of column {}: {}", col, e)))?;
        let max_val = *column
            .max()
            .map_err(|e| TrainingError::DataProcessing(format!("max of column {}: {}", col, e)))?;

        let mean = column.sum() / n_rows as f64;
        let variance = column.iter().map(|&x| (x - mean).powi(2)).sum::<f64>() / n_rows as f64;
        let std = variance.sqrt().max(1e-8);

        frame
            .values
            .column_mut(col)
            .mapv_inplace(|x| (x - mean) / std);

        means.push(mean);
        stds.push(std);
        min_values.push(min_val);
        max_values.push(max_val);
    }

    debug!("📊 [Data] Normalized {} channels", frame.num_channels());

    Ok(ColumnStats {
        column_names: frame.column_names.clone(),
        means,
        stds,
        min_values,
        max_values,
    })
}

/// Resolves the two forecast channels by header name.
pub fn target_indices(
    frame: &SensorFrame,
    name_a: &str,
    name_b: &str,
) -> Result<[usize; 2], TrainingError> {
    Ok([frame.column_index(name_a)?, frame.column_index(name_b)?])
}

/// One training batch: `x` is (rows, lookback / step, channels), `y` is
/// (rows, 2) holding the two forecast targets `delay` steps ahead.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Array3<f64>,
    pub y: Array2<f64>,
}

/// Infinite sliding-window batch generator over a normalized sensor table.
///
/// Row index `r` yields a window of the `lookback` timesteps before `r`
/// (subsampled by `step`) and the target channels at `r + delay`. Sequential
/// mode walks `[min_index + lookback, max_index)` and wraps around; shuffle
/// mode draws row indices uniformly from the same range.
pub struct WindowBatches<'a> {
    data: &'a Array2<f64>,
    target_columns: [usize; 2],
    lookback: usize,
    delay: usize,
    step: usize,
    batch_size: usize,
    min_index: usize,
    max_index: usize,
    shuffle: bool,
    cursor: usize,
    rng: ThreadRng,
}

impl<'a> WindowBatches<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        data: &'a Array2<f64>,
        target_columns: [usize; 2],
        lookback: usize,
        delay: usize,
        min_index: Option<usize>,
        max_index: Option<usize>,
        shuffle: bool,
        batch_size: usize,
        step: usize,
    ) -> Result<Self, TrainingError> {
        let len = data.nrows();
        let min_index = min_index.unwrap_or(0);
        let max_index = match max_index {
            Some(m) => m,
            None => len
                .checked_sub(delay + 1)
                .ok_or_else(|| TrainingError::DataProcessing("dataset shorter than delay".to_string()))?,
        };

        if step == 0 || lookback == 0 || lookback % step != 0 {
            return Err(TrainingError::ModelConfiguration(format!(
                "lookback {} must be a positive multiple of step {}",
                lookback, step
            )));
        }
        if batch_size == 0 {
            return Err(TrainingError::ModelConfiguration("batch_size must be >= 1".to_string()));
        }
        if max_index + delay > len {
            return Err(TrainingError::DataProcessing(format!(
                "max_index {} with delay {} exceeds {} rows",
                max_index, delay, len
            )));
        }
        if min_index + lookback >= max_index {
            return Err(TrainingError::DataProcessing(format!(
                "window range [{}, {}) leaves no room for a lookback of {}",
                min_index, max_index, lookback
            )));
        }
        for &col in &target_columns {
            if col >= data.ncols() {
                return Err(TrainingError::DataProcessing(format!(
                    "target column {} out of range for {} channels",
                    col,
                    data.ncols()
                )));
            }
        }

        Ok(WindowBatches {
            data,
            target_columns,
            lookback,
            delay,
            step,
            batch_size,
            min_index,
            max_index,
            shuffle,
            cursor: min_index + lookback,
            rng: rand::rng(),
        })
    }

    /// Number of whole batches one pass over the window range yields.
    pub fn steps_per_sweep(&self) -> usize {
        (self.max_index - self.min_index - self.lookback) / self.batch_size
    }

    /// Draws the next batch. The generator is infinite, so this always
    /// produces one.
    pub fn next_batch(&mut self) -> Batch {
        let rows = self.draw_rows();
        let window_len = self.lookback / self.step;
        let channels = self.data.ncols();

        let mut x = Array3::zeros((rows.len(), window_len, channels));
        let mut y = Array2::zeros((rows.len(), 2));

        for (i, &row) in rows.iter().enumerate() {
            for (k, t) in (row - self.lookback..row).step_by(self.step).enumerate() {
                x.slice_mut(s![i, k, ..]).assign(&self.data.row(t));
            }
            y[[i, 0]] = self.data[[row + self.delay, self.target_columns[0]]];
            y[[i, 1]] = self.data[[row + self.delay, self.target_columns[1]]];
        }

        Batch { x, y }
    }

    fn draw_rows(&mut self) -> Vec<usize> {
        if self.shuffle {
            let low = self.min_index + self.lookback;
            return (0..self.batch_size)
                .map(|_| self.rng.random_range(low..self.max_index))
                .collect();
        }

        if self.cursor + self.batch_size >= self.max_index {
            self.cursor = self.min_index + self.lookback;
        }
        let end = (self.cursor + self.batch_size).min(self.max_index);
        let rows: Vec<usize> = (self.cursor..end).collect();
        self.cursor += rows.len();
        rows
    }
}

impl Iterator for WindowBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.next_batch())
    }
}

/// Extracts a single channel as a plain vector, for plotting.
pub fn channel_series(frame: &SensorFrame, column: usize) -> Vec<f64> {
    frame.values.column(column).to_vec()
}

#[allow(dead_code)]
pub fn denormalize(value: f64, stats: &ColumnStats, column: usize) -> f64 {
    value * stats.stds[column] + stats.means[column]
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    /// Two-channel table where every cell carries its own row index, so
    /// window contents can be asserted exactly.
    fn indexed_data(len: usize) -> Array2<f64> {
        Array2::from_shape_fn((len, 2), |(r, _)| r as f64)
    }

    #[test]
    fn test_load_sensor_csv_drops_time_and_incomplete_rows() {
        let dir = std::env::temp_dir().join("sagmilltrain_data_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sensors.csv");
        std::fs::write(
            &path,
            "time,Mill weight,Mill main drive - Main motor current\n\
             2020-01-01 00:00,100.5,8.1\n\
             2020-01-01 00:01,,8.2\n\
             2020-01-01 00:02,101.0,8.3\n\
             2020-01-01 00:03,bad,8.4\n",
        )
        .unwrap();

        let frame = load_sensor_csv(&path).unwrap();
        assert_eq!(frame.num_rows(), 2);
        assert_eq!(frame.num_channels(), 2);
        assert_eq!(
            frame.column_names,
            vec!["Mill weight", "Mill main drive - Main motor current"]
        );
        assert_eq!(frame.values[[0, 0]], 100.5);
        assert_eq!(frame.values[[1, 1]], 8.3);
        assert_eq!(frame.column_index("Mill weight").unwrap(), 0);
        assert!(frame.column_index("nonexistent").is_err());
        assert_eq!(
            target_indices(&frame, "Mill main drive - Main motor current", "Mill weight").unwrap(),
            [1, 0]
        );
    }

    #[test]
    fn test_normalize_centers_and_scales() {
        let mut frame = SensorFrame {
            column_names: vec!["a".to_string(), "constant".to_string()],
            values: Array2::from_shape_vec((4, 2), vec![1.0, 5.0, 2.0, 5.0, 3.0, 5.0, 4.0, 5.0])
                .unwrap(),
        };

        let stats = normalize(&mut frame).unwrap();

        assert!((stats.means[0] - 2.5).abs() < 1e-12);
        assert_eq!(stats.min_values[0], 1.0);
        assert_eq!(stats.max_values[0], 4.0);

        let col = frame.values.column(0);
        let mean: f64 = col.sum() / 4.0;
        assert!(mean.abs() < 1e-12);

        // Zero-variance channel stays finite and centered.
        for &v in frame.values.column(1) {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_window_default_bounds() {
        let data = indexed_data(50);
        let generator =
            WindowBatches::new(&data, [0, 1], 4, 3, None, None, false, 8, 1).unwrap();
        // max_index defaults to len - delay - 1.
        assert_eq!(generator.max_index, 46);
        assert_eq!(generator.min_index, 0);
        assert_eq!(generator.cursor, 4);
    }

    #[test]
    fn test_window_contents_and_target_alignment() {
        let data = indexed_data(40);
        let mut generator =
            WindowBatches::new(&data, [0, 1], 6, 2, None, None, false, 4, 2).unwrap();

        let batch = generator.next().unwrap();
        assert_eq!(batch.x.dim(), (4, 3, 2)); // lookback / step = 3
        assert_eq!(batch.y.dim(), (4, 2));

        // First row index is min_index + lookback = 6; its window reads
        // timesteps 0, 2, 4 and its target sits at 6 + delay = 8.
        assert_eq!(batch.x[[0, 0, 0]], 0.0);
        assert_eq!(batch.x[[0, 1, 0]], 2.0);
        assert_eq!(batch.x[[0, 2, 0]], 4.0);
        assert_eq!(batch.y[[0, 0]], 8.0);
        assert_eq!(batch.y[[0, 1]], 8.0);

        // Second row shifts everything by one timestep.
        assert_eq!(batch.x[[1, 0, 0]], 1.0);
        assert_eq!(batch.y[[1, 0]], 9.0);
    }

    #[test]
    fn test_window_sequential_wraparound() {
        let data = indexed_data(20);
        let mut generator =
            WindowBatches::new(&data, [0, 1], 4, 0, Some(0), Some(12), false, 5, 1).unwrap();

        let first = generator.next().unwrap();
        assert_eq!(first.y.column(0).to_vec(), vec![4.0, 5.0, 6.0, 7.0, 8.0]);

        // Cursor is at 9; 9 + 5 >= 12, so the generator wraps before drawing.
        let second = generator.next().unwrap();
        assert_eq!(second.y.column(0).to_vec(), vec![4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_window_shuffle_stays_in_bounds() {
        let data = indexed_data(60);
        let delay = 3;
        let mut generator =
            WindowBatches::new(&data, [0, 1], 8, delay, Some(5), Some(40), true, 16, 1).unwrap();

        for _ in 0..10 {
            let batch = generator.next().unwrap();
            for &target in batch.y.column(0) {
                // Cell value encodes the row index, so the drawn row is
                // target - delay.
                let row = target as usize - delay;
                assert!(row >= 5 + 8);
                assert!(row < 40);
            }
        }
    }

    #[test]
    fn test_window_rejects_bad_ranges() {
        let data = indexed_data(30);
        assert!(WindowBatches::new(&data, [0, 1], 25, 10, None, None, false, 4, 1).is_err());
        assert!(WindowBatches::new(&data, [0, 1], 5, 10, Some(0), Some(25), false, 4, 1).is_err());
        assert!(WindowBatches::new(&data, [0, 5], 5, 2, None, None, false, 4, 1).is_err());
        assert!(WindowBatches::new(&data, [0, 1], 5, 2, None, None, false, 4, 2).is_err());
    }

    #[test]
    fn test_steps_per_sweep() {
        let data = indexed_data(1000);
        let generator =
            WindowBatches::new(&data, [0, 1], 100, 5, Some(0), Some(900), false, 50, 1).unwrap();
        assert_eq!(generator.steps_per_sweep(), (900 - 100) / 50);
    }
}
