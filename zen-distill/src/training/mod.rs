//! Training infrastructure for node classification
//!
//! - [`controller`]: the early-stopping loop with best-snapshot restore
//! - [`optimizers`]: Adam and SGD with capturable state
//! - [`losses`]: NLL, softmax and accuracy over node subsets
//! - [`distill`]: hard-label and knowledge-distillation objectives
//! - [`checkpoint`]: owned parameter/optimizer snapshots
//! - [`observer`]: per-epoch records and their consumers

pub mod checkpoint;
pub mod controller;
pub mod distill;
pub mod losses;
pub mod observer;
pub mod optimizers;

pub use checkpoint::Checkpoint;
pub use controller::{LoopConfig, StopReason, TrainingLoop, TrainingOutcome, TrainingState};
pub use distill::{DistillationObjective, HardLabelObjective, Objective};
pub use losses::{accuracy, log_softmax, nll_loss, nll_loss_and_grad, predictions, softmax};
pub use observer::{EpochObserver, EpochRecord, HistoryRecorder, LogObserver, NoopObserver, TrainingPhase};
pub use optimizers::{Adam, Optimizer, OptimizerConfig, OptimizerState, Sgd};
