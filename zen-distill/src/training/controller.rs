/**
 * @file zen-distill/src/training/controller.rs
 * @brief Epoch-bounded training with validation tracking and early stopping
 *
 * ## Loop semantics
 *
 * Each epoch `e = 1, 2, …`:
 *
 * 1. Forward the full graph in training mode, compute the objective on the
 *    train nodes, backpropagate and take one optimizer step.
 * 2. Forward again in inference mode and measure validation loss/accuracy.
 * 3. If `val_acc >= best` the epoch is an improvement: `best` is updated, a
 *    fresh [`Checkpoint`] of model and optimizer replaces the previous one and
 *    the stale counter resets. Equal accuracy counts, so on a plateau at the
 *    peak the latest epoch wins.
 * 4. Otherwise the stale counter grows by one.
 * 5. The loop stops when the stale counter reaches `patience` or `e` reaches
 *    `max_epoch`.
 *
 * On stop the best checkpoint is restored into the model and the optimizer,
 * and test metrics are computed from the restored model.
 */

use std::time::{Duration, Instant};

use log::debug;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use super::checkpoint::Checkpoint;
use super::distill::Objective;
use super::losses::{accuracy, log_softmax, nll_loss};
use super::observer::{EpochObserver, EpochRecord, TrainingPhase};
use super::optimizers::Optimizer;
use crate::data::{DatasetSplit, GraphData, LabelVector};
use crate::errors::{DistillError, Result};
use crate::models::{GraphModel, TrainingMode};

// === CONFIGURATION ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Upper bound on the number of epochs
    pub max_epoch: usize,
    /// Consecutive non-improving epochs tolerated before stopping
    pub patience: usize,
    /// Keep each epoch's inference probabilities up to the best epoch
    #[serde(default)]
    pub keep_cascade: bool,
}

impl LoopConfig {
    pub fn new(max_epoch: usize, patience: usize) -> Self {
        Self {
            max_epoch,
            patience,
            keep_cascade: false,
        }
    }

    pub fn with_cascade(mut self, keep_cascade: bool) -> Self {
        self.keep_cascade = keep_cascade;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_epoch == 0 {
            return Err(DistillError::InvalidConfiguration(
                "max_epoch must be at least 1".to_string(),
            ));
        }
        if self.patience == 0 {
            return Err(DistillError::InvalidConfiguration(
                "patience must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// === STATE AND RESULTS ===

/// Mutable loop state, alive for the duration of one run
#[derive(Debug, Clone)]
pub struct TrainingState {
    pub current_epoch: usize,
    pub best_val_metric: f32,
    pub best_checkpoint: Option<Checkpoint>,
    pub epochs_since_improvement: usize,
    pub phase: TrainingPhase,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            current_epoch: 1,
            best_val_metric: f32::NEG_INFINITY,
            best_checkpoint: None,
            epochs_since_improvement: 0,
            phase: TrainingPhase::Running,
        }
    }
}

impl TrainingState {
    /// Fold one validation result into the state and return the new phase
    fn observe(&mut self, val_acc: f32, snapshot: impl FnOnce() -> Checkpoint) -> TrainingPhase {
        self.phase = if val_acc >= self.best_val_metric {
            self.best_val_metric = val_acc;
            self.best_checkpoint = Some(snapshot());
            self.epochs_since_improvement = 0;
            TrainingPhase::Improved
        } else {
            self.epochs_since_improvement += 1;
            TrainingPhase::Stale
        };
        self.phase
    }
}

/// Reason why training stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    MaxEpochsReached,
    EarlyStopping,
}

#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Restored snapshot
    pub best: Checkpoint,
    /// Validation accuracy per epoch
    pub val_history: Vec<f32>,
    pub history: Vec<EpochRecord>,
    pub test_accuracy: f32,
    pub test_loss: f32,
    pub stop_reason: StopReason,
    pub stopped_at: usize,
    /// Inference log-probabilities of the restored model, every node
    pub log_probs: Array2<f32>,
    /// Attention of the restored model, if the model has any
    pub attention: Option<Array1<f32>>,
    /// Per-epoch inference probabilities up to the best epoch (if kept)
    pub cascade: Vec<Array2<f32>>,
    pub elapsed: Duration,
}

impl TrainingOutcome {
    pub fn best_epoch(&self) -> usize {
        self.best.epoch
    }

    pub fn best_val_accuracy(&self) -> f32 {
        self.val_history
            .get(self.best.epoch.saturating_sub(1))
            .copied()
            .unwrap_or(0.0)
    }
}

// === LOOP ===

#[derive(Debug, Clone)]
pub struct TrainingLoop {
    config: LoopConfig,
}

impl TrainingLoop {
    pub fn new(config: LoopConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /**
     * Train `model` with `optimizer` until early stopping or `max_epoch`.
     *
     * The model and optimizer are borrowed exclusively for the whole run and
     * are left holding the restored best snapshot.
     */
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        model: &mut dyn GraphModel,
        optimizer: &mut dyn Optimizer,
        graph: &GraphData,
        labels: &LabelVector,
        split: &DatasetSplit,
        objective: &dyn Objective,
        observer: &mut dyn EpochObserver,
    ) -> Result<TrainingOutcome> {
        if labels.len() != graph.num_nodes() {
            return Err(DistillError::DimensionMismatch(format!(
                "Graph has {} nodes but {} labels were given",
                graph.num_nodes(),
                labels.len()
            )));
        }
        if split.train.is_empty() {
            return Err(DistillError::InvalidInput(
                "Training set is empty".to_string(),
            ));
        }

        let labels = labels.as_slice();
        let started = Instant::now();
        let mut state = TrainingState::default();
        let mut history = Vec::new();
        let mut val_history = Vec::new();
        let mut cascade = Vec::new();

        let stop_reason = loop {
            let epoch = state.current_epoch;
            let epoch_start = Instant::now();

            let output = model.forward(graph, TrainingMode::Training)?;
            let (train_loss, grad_logits) = objective.loss_and_grad(&output.logits, labels, &split.train)?;
            if !train_loss.is_finite() {
                return Err(DistillError::NumericalInstability(format!(
                    "Training loss became {} at epoch {}",
                    train_loss, epoch
                )));
            }
            let train_acc = accuracy(&output.logits, labels, &split.train)?;

            let grads = model.backward(&grad_logits)?;
            optimizer.step(model.parameters_mut(), &grads)?;

            let eval = model.forward(graph, TrainingMode::Inference)?;
            let log_probs = log_softmax(&eval.logits);
            let val_loss = nll_loss(&log_probs, labels, &split.val)?;
            let val_acc = accuracy(&log_probs, labels, &split.val)?;
            let test_acc = accuracy(&log_probs, labels, &split.test)?;

            let phase = state.observe(val_acc, || Checkpoint::capture(&*model, &*optimizer, epoch));
            if self.config.keep_cascade {
                cascade.push(log_probs.mapv(f32::exp));
            }

            let record = EpochRecord {
                epoch,
                train_loss,
                train_acc,
                val_loss,
                val_acc,
                test_acc,
                phase,
                elapsed: epoch_start.elapsed(),
            };
            observer.on_epoch(&record);
            history.push(record);
            val_history.push(val_acc);

            if state.epochs_since_improvement == self.config.patience {
                break StopReason::EarlyStopping;
            }
            if epoch == self.config.max_epoch {
                break StopReason::MaxEpochsReached;
            }
            state.current_epoch += 1;
        };

        state.phase = TrainingPhase::Stopped;
        let stopped_at = state.current_epoch;
        let best = state.best_checkpoint.take().ok_or_else(|| {
            DistillError::InvalidInput("Training stopped without a checkpoint".to_string())
        })?;
        observer.on_stop(stopped_at, best.epoch);
        debug!(
            "Stopped at epoch {} ({:?}), best validation accuracy {:.4} at epoch {}",
            stopped_at, stop_reason, state.best_val_metric, best.epoch
        );

        best.restore(model, optimizer)?;
        cascade.truncate(best.epoch);

        let eval = model.forward(graph, TrainingMode::Inference)?;
        let log_probs = log_softmax(&eval.logits);
        let test_loss = nll_loss(&log_probs, labels, &split.test)?;
        let test_accuracy = accuracy(&log_probs, labels, &split.test)?;

        Ok(TrainingOutcome {
            best,
            val_history,
            history,
            test_accuracy,
            test_loss,
            stop_reason,
            stopped_at,
            log_probs,
            attention: eval.attention,
            cascade,
            elapsed: started.elapsed(),
        })
    }
}

// === TESTS ===

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::IndexSet;
    use crate::models::{ModelKind, ModelOutput};
    use crate::training::distill::HardLabelObjective;
    use crate::training::observer::HistoryRecorder;
    use crate::training::optimizers::Sgd;

    const VAL_NODES: usize = 10;

    /**
     * Model whose only parameter counts optimizer steps. With SGD at lr 1 and
     * a constant gradient of -1, the counter equals the epoch number, and the
     * validation accuracy after epoch `e` is `script(e)`.
     */
    struct ScriptedModel {
        counter: Array2<f32>,
        script: fn(usize) -> f32,
    }

    impl ScriptedModel {
        fn new(script: fn(usize) -> f32) -> Self {
            Self {
                counter: Array2::zeros((1, 1)),
                script,
            }
        }

        fn steps(&self) -> usize {
            self.counter[[0, 0]].round() as usize
        }
    }

    impl GraphModel for ScriptedModel {
        fn kind(&self) -> ModelKind {
            ModelKind::Mlp
        }

        fn forward(&mut self, graph: &GraphData, _mode: TrainingMode) -> Result<ModelOutput> {
            let correct = ((self.script)(self.steps()) * VAL_NODES as f32).round() as usize;
            let logits = Array2::from_shape_fn((graph.num_nodes(), 2), |(node, class)| {
                // validation nodes are 0..VAL_NODES; label 0 everywhere
                let right = node >= VAL_NODES || node < correct;
                match (right, class) {
                    (true, 0) | (false, 1) => 1.0,
                    _ => 0.0,
                }
            });
            Ok(ModelOutput::new(logits))
        }

        fn backward(&mut self, _grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
            Ok(vec![Array2::from_elem((1, 1), -1.0)])
        }

        fn parameters(&self) -> Vec<&Array2<f32>> {
            vec![&self.counter]
        }

        fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
            vec![&mut self.counter]
        }
    }

    fn fixture() -> (GraphData, LabelVector, DatasetSplit) {
        let graph = GraphData::new(Array2::zeros((20, 1)), vec![]).unwrap();
        let labels = LabelVector::new(vec![0; 20]).unwrap();
        let split = DatasetSplit {
            val: (0..VAL_NODES).collect(),
            train: (10..15).collect(),
            test: (15..20).collect::<IndexSet>(),
        };
        (graph, labels, split)
    }

    fn run(script: fn(usize) -> f32, max_epoch: usize, patience: usize) -> (TrainingOutcome, ScriptedModel, Sgd) {
        let (graph, labels, split) = fixture();
        let mut model = ScriptedModel::new(script);
        let mut optimizer = Sgd::new(1.0);
        let mut recorder = HistoryRecorder::default();

        let outcome = TrainingLoop::new(LoopConfig::new(max_epoch, patience).with_cascade(true))
            .unwrap()
            .run(
                &mut model,
                &mut optimizer,
                &graph,
                &labels,
                &split,
                &HardLabelObjective,
                &mut recorder,
            )
            .unwrap();

        assert_eq!(recorder.records, outcome.history);
        assert_eq!(recorder.stopped, Some((outcome.stopped_at, outcome.best.epoch)));
        (outcome, model, optimizer)
    }

    #[test]
    fn test_peak_then_flatline_stops_after_patience() {
        // rises for 10 epochs, then a plateau below the peak
        let (outcome, model, optimizer) = run(|e| if e <= 10 { e as f32 / 10.0 } else { 0.5 }, 50, 5);

        assert_eq!(outcome.stop_reason, StopReason::EarlyStopping);
        assert_eq!(outcome.stopped_at, 15);
        assert_eq!(outcome.best.epoch, 10);
        assert_eq!(outcome.history.len(), 15);
        assert_eq!(outcome.val_history.len(), 15);
        assert_eq!(outcome.best_val_accuracy(), 1.0);

        // model and optimizer hold the epoch-10 snapshot
        assert_eq!(model.steps(), 10);
        assert_eq!(optimizer.state().step, 10);
        assert_eq!(outcome.cascade.len(), 10);
        assert_eq!(outcome.test_accuracy, 1.0);
    }

    #[test]
    fn test_ties_take_the_later_snapshot() {
        let (outcome, model, _) = run(
            |e| match e {
                0..=4 => e as f32 / 10.0,
                5..=8 => 0.5,
                _ => 0.2,
            },
            50,
            3,
        );

        assert_eq!(outcome.best.epoch, 8);
        assert_eq!(outcome.stopped_at, 11);
        assert_eq!(model.steps(), 8);

        let phases: Vec<_> = outcome.history.iter().map(|r| r.phase).collect();
        assert_eq!(phases[5..8], [TrainingPhase::Improved; 3]);
        assert_eq!(phases[8..], [TrainingPhase::Stale; 3]);
    }

    #[test]
    fn test_stop_at_k_plus_patience() {
        for (peak, patience) in [(1usize, 1usize), (3, 2), (7, 4)] {
            let script: fn(usize) -> f32 = match peak {
                1 => |e| if e <= 1 { 0.9 } else { 0.1 },
                3 => |e| if e <= 3 { 0.3 * e as f32 } else { 0.1 },
                _ => |e| if e <= 7 { 0.1 * e as f32 } else { 0.1 },
            };
            let (outcome, model, _) = run(script, 100, patience);
            assert_eq!(outcome.stopped_at, peak + patience);
            assert_eq!(outcome.best.epoch, peak);
            assert_eq!(model.steps(), peak);
        }
    }

    #[test]
    fn test_max_epoch_bounds_the_run() {
        let (outcome, model, _) = run(|e| (e as f32 / 20.0).min(1.0), 8, 5);
        assert_eq!(outcome.stop_reason, StopReason::MaxEpochsReached);
        assert_eq!(outcome.stopped_at, 8);
        assert_eq!(outcome.history.len(), 8);
        assert_eq!(outcome.best.epoch, 8);
        assert_eq!(model.steps(), 8);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(TrainingLoop::new(LoopConfig::new(0, 5)).is_err());
        assert!(TrainingLoop::new(LoopConfig::new(5, 0)).is_err());

        let (graph, labels, mut split) = fixture();
        split.train = IndexSet::new();
        let result = TrainingLoop::new(LoopConfig::new(5, 2)).unwrap().run(
            &mut ScriptedModel::new(|_| 0.5),
            &mut Sgd::new(1.0),
            &graph,
            &labels,
            &split,
            &HardLabelObjective,
            &mut crate::training::observer::NoopObserver,
        );
        assert!(matches!(result, Err(DistillError::InvalidInput(_))));
    }
}
