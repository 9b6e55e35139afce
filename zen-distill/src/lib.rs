//! Graph neural network training and knowledge distillation
//!
//! zen-distill trains node-classification teachers (GCN, GAT, GraphSAGE, SGC,
//! APPNP) on citation and provenance-graph datasets, optionally distills them
//! into a graph-free MLP student, and runs seeded hyperparameter searches.
//!
//! The pieces, in dependency order:
//!
//! - [`data`]: graph structures, dataset loading and the stratified splitter
//! - [`models`]: the architectures behind the [`models::GraphModel`] trait
//! - [`training`]: the early-stopping loop, optimizers, losses and objectives
//! - [`config`]: layered configuration resolution into [`ExperimentConfig`]
//! - [`experiment`]: one end-to-end run
//! - [`search`]: hyperparameter search and variant grids
//! - [`report`]: result tables and persisted outputs
//!
//! ## Quick start
//!
//! ```rust
//! use zen_distill::data::{load_dataset, DatasetSource, LoadOptions, SyntheticConfig};
//! use zen_distill::{run_experiment, ConfigTable, ExperimentConfig};
//!
//! let dataset = load_dataset(
//!     &DatasetSource::Synthetic(SyntheticConfig::default()),
//!     &LoadOptions::default(),
//! )?;
//!
//! let mut table = ConfigTable::new();
//! for assignment in ["model_name=GCN", "max_epoch=20", "patience=5", "lr=0.01", "wd=5e-4", "division_seed=0"] {
//!     table.set_override(assignment)?;
//! }
//! table.set_override(r#"split={"mode":"ratio","train_ratio":0.8,"val_ratio":0.1}"#)?;
//! let config = ExperimentConfig::from_table(&table)?;
//!
//! let result = run_experiment(&dataset, &config)?;
//! assert!(result.test_accuracy() <= 1.0);
//! # Ok::<(), zen_distill::DistillError>(())
//! ```

// Re-export main types
pub use config::{ConfigResolver, ConfigTable, ExperimentConfig};
pub use errors::{DistillError, Result};
pub use experiment::{run_experiment, save_experiment, ExperimentResult, RunResult};
pub use report::{ResultTable, TableFormat};
pub use search::{gen_variants, HyperparameterSearch, SearchSpace, Variant};

// Modules
pub mod config;
pub mod data;
pub mod errors;
pub mod experiment;
pub mod models;
pub mod report;
pub mod search;
pub mod training;

/// Crate version, as reported by the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
