//! Per-epoch records and the observers that receive them

use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Where the loop stands after an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingPhase {
    Running,
    /// Validation accuracy matched or beat the best so far
    Improved,
    /// No improvement this epoch
    Stale,
    Stopped,
}

/// Metrics of a single epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f32,
    pub train_acc: f32,
    pub val_loss: f32,
    pub val_acc: f32,
    pub test_acc: f32,
    pub phase: TrainingPhase,
    pub elapsed: Duration,
}

pub trait EpochObserver {
    fn on_epoch(&mut self, record: &EpochRecord);

    /// Called once when the loop stops, with the epoch whose snapshot is restored
    fn on_stop(&mut self, _stopped_at: usize, _best_epoch: usize) {}
}

/// Discards every record
#[derive(Debug, Default)]
pub struct NoopObserver;

impl EpochObserver for NoopObserver {
    fn on_epoch(&mut self, _record: &EpochRecord) {}
}

/// Logs one line per epoch at `info` level
#[derive(Debug, Default)]
pub struct LogObserver {
    /// Prefix identifying the run (dataset/model/seed)
    pub label: String,
}

impl LogObserver {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl EpochObserver for LogObserver {
    fn on_epoch(&mut self, record: &EpochRecord) {
        info!(
            "{}Epoch {} | Loss: {:.4} | loss_val: {:.4} | acc_train: {:.4} | acc_val: {:.4} | acc_test: {:.4} | Time(s) {:.4}",
            prefix(&self.label),
            record.epoch,
            record.train_loss,
            record.val_loss,
            record.train_acc,
            record.val_acc,
            record.test_acc,
            record.elapsed.as_secs_f64()
        );
        debug!("{}phase after epoch {}: {:?}", prefix(&self.label), record.epoch, record.phase);
    }

    fn on_stop(&mut self, stopped_at: usize, best_epoch: usize) {
        info!(
            "{}Stopped at epoch {}, restoring epoch {}",
            prefix(&self.label),
            stopped_at,
            best_epoch
        );
    }
}

fn prefix(label: &str) -> String {
    if label.is_empty() {
        String::new()
    } else {
        format!("[{}] ", label)
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct HistoryRecorder {
    pub records: Vec<EpochRecord>,
    pub stopped: Option<(usize, usize)>,
}

impl EpochObserver for HistoryRecorder {
    fn on_epoch(&mut self, record: &EpochRecord) {
        self.records.push(record.clone());
    }

    fn on_stop(&mut self, stopped_at: usize, best_epoch: usize) {
        self.stopped = Some((stopped_at, best_epoch));
    }
}
