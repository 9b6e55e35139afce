//! Hyperparameter search and experiment variants
//!
//! Trials are sampled up front from a seeded generator, then evaluated
//! independently: each trial resolves its own [`ExperimentConfig`], builds its
//! own model and optimizer, and shares the dataset and split read-only. With
//! the `parallel` feature the trials run on a rayon pool of `njobs` threads.
//! The objective is the best validation accuracy of the final model.

use std::ops::RangeInclusive;

use log::{info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::{ConfigTable, ExperimentConfig};
use crate::data::{Dataset, DatasetSplit};
use crate::errors::{DistillError, Result};
use crate::experiment::run_on_split;
use crate::models::ModelKind;

// === VARIANTS ===

/// One cell of the dataset × model × seed grid
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub dataset: String,
    pub model: ModelKind,
    pub seed: u64,
}

impl Variant {
    /// Row key for result tables (the seed is aggregated over)
    pub fn key(&self) -> Vec<String> {
        vec![self.dataset.clone(), self.model.to_string()]
    }
}

/// Cartesian product in dataset-major order
pub fn gen_variants(datasets: &[String], models: &[ModelKind], seeds: &[u64]) -> Vec<Variant> {
    let mut variants = Vec::with_capacity(datasets.len() * models.len() * seeds.len());
    for dataset in datasets {
        for &model in models {
            for &seed in seeds {
                variants.push(Variant {
                    dataset: dataset.clone(),
                    model,
                    seed,
                });
            }
        }
    }
    variants
}

// === SEARCH SPACE ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub num_layers: RangeInclusive<usize>,
    pub embed_dim: Vec<usize>,
    pub dropout: Vec<f32>,
    pub attn_drop: Vec<f32>,
    pub learning_rate: Vec<f32>,
    pub weight_decay: Vec<f32>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            num_layers: 5..=10,
            embed_dim: vec![64, 32, 16, 8],
            dropout: vec![0.8, 0.5, 0.2],
            attn_drop: vec![0.8, 0.5, 0.2],
            learning_rate: vec![1e-3, 5e-3, 1e-2],
            weight_decay: vec![5e-4, 1e-3, 1e-2],
        }
    }
}

/// Hyperparameters drawn for one trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialParams {
    pub trial: usize,
    pub num_layers: usize,
    pub embed_dim: usize,
    pub dropout: f32,
    pub attn_drop: f32,
    pub learning_rate: f32,
    pub weight_decay: f32,
}

impl TrialParams {
    /// Configuration layer applied over the base table
    pub fn to_layer(&self) -> Map<String, Value> {
        let mut layer = Map::new();
        layer.insert("num_layers".to_string(), json!(self.num_layers));
        layer.insert("embed_dim".to_string(), json!(self.embed_dim));
        layer.insert("dropout".to_string(), json!(self.dropout));
        layer.insert("attn_drop".to_string(), json!(self.attn_drop));
        layer.insert("learning_rate".to_string(), json!(self.learning_rate));
        layer.insert("weight_decay".to_string(), json!(self.weight_decay));
        layer
    }
}

fn pick<T: Copy>(rng: &mut ChaCha8Rng, choices: &[T]) -> T {
    choices[rng.gen_range(0..choices.len())]
}

impl SearchSpace {
    pub fn validate(&self) -> Result<()> {
        let empty = [
            ("num_layers", self.num_layers.is_empty()),
            ("embed_dim", self.embed_dim.is_empty()),
            ("dropout", self.dropout.is_empty()),
            ("attn_drop", self.attn_drop.is_empty()),
            ("learning_rate", self.learning_rate.is_empty()),
            ("weight_decay", self.weight_decay.is_empty()),
        ];
        match empty.iter().find(|(_, is_empty)| *is_empty) {
            Some((name, _)) => Err(DistillError::InvalidConfiguration(format!(
                "Search space for {} is empty",
                name
            ))),
            None => Ok(()),
        }
    }

    pub fn sample(&self, rng: &mut ChaCha8Rng, trial: usize) -> TrialParams {
        TrialParams {
            trial,
            num_layers: rng.gen_range(self.num_layers.clone()),
            embed_dim: pick(rng, &self.embed_dim),
            dropout: pick(rng, &self.dropout),
            attn_drop: pick(rng, &self.attn_drop),
            learning_rate: pick(rng, &self.learning_rate),
            weight_decay: pick(rng, &self.weight_decay),
        }
    }

    /// `ntrials` draws from one generator seeded with `seed`
    pub fn sample_trials(&self, ntrials: usize, seed: u64) -> Result<Vec<TrialParams>> {
        self.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Ok((0..ntrials).map(|trial| self.sample(&mut rng, trial)).collect())
    }
}

// === SEARCH ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub params: TrialParams,
    pub best_val_accuracy: f32,
    pub test_accuracy: f32,
    pub best_epoch: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Completed trials, best validation accuracy first
    pub trials: Vec<TrialResult>,
    /// Trials rejected by their own configuration
    pub skipped: usize,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&TrialResult> {
        self.trials.first()
    }
}

#[derive(Debug, Clone)]
pub struct HyperparameterSearch {
    pub space: SearchSpace,
    pub ntrials: usize,
    pub njobs: usize,
    /// Seed of the trial sampler
    pub seed: u64,
}

impl HyperparameterSearch {
    pub fn new(ntrials: usize, njobs: usize) -> Self {
        Self {
            space: SearchSpace::default(),
            ntrials,
            njobs,
            seed: 0,
        }
    }

    pub fn with_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Evaluate every trial over `base` on a fixed split
    pub fn run(&self, dataset: &Dataset, split: &DatasetSplit, base: &ConfigTable) -> Result<SearchOutcome> {
        if self.njobs == 0 {
            return Err(DistillError::InvalidConfiguration(
                "Search needs at least one job".to_string(),
            ));
        }
        let trials = self.space.sample_trials(self.ntrials, self.seed)?;
        info!("Running {} trials on {} jobs", trials.len(), self.njobs);

        let results = self.evaluate_all(&trials, dataset, split, base)?;

        let mut outcome = SearchOutcome::default();
        for result in results {
            match result {
                Ok(trial) => outcome.trials.push(trial),
                Err(e) if e.is_configuration_error() => {
                    warn!("Skipping trial: {}", e);
                    outcome.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        outcome.trials.sort_by(|a, b| {
            b.best_val_accuracy
                .total_cmp(&a.best_val_accuracy)
                .then(a.params.trial.cmp(&b.params.trial))
        });

        if let Some(best) = outcome.best() {
            info!(
                "Best trial {}: val acc {:.4}, test acc {:.4} ({:?})",
                best.params.trial, best.best_val_accuracy, best.test_accuracy, best.params
            );
        }
        Ok(outcome)
    }

    #[cfg(feature = "parallel")]
    fn evaluate_all(
        &self,
        trials: &[TrialParams],
        dataset: &Dataset,
        split: &DatasetSplit,
        base: &ConfigTable,
    ) -> Result<Vec<Result<TrialResult>>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.njobs)
            .build()
            .map_err(|e| DistillError::InvalidConfiguration(format!("Cannot build thread pool: {}", e)))?;
        Ok(pool.install(|| {
            trials
                .par_iter()
                .map(|params| evaluate(params, dataset, split, base))
                .collect()
        }))
    }

    #[cfg(not(feature = "parallel"))]
    fn evaluate_all(
        &self,
        trials: &[TrialParams],
        dataset: &Dataset,
        split: &DatasetSplit,
        base: &ConfigTable,
    ) -> Result<Vec<Result<TrialResult>>> {
        Ok(trials
            .iter()
            .map(|params| evaluate(params, dataset, split, base))
            .collect())
    }
}

fn evaluate(params: &TrialParams, dataset: &Dataset, split: &DatasetSplit, base: &ConfigTable) -> Result<TrialResult> {
    let mut table = base.clone();
    table.merge(&params.to_layer());
    let config = ExperimentConfig::from_table(&table)?;
    let result = run_on_split(dataset, split.clone(), &config, false)?;
    let outcome = &result.final_run().outcome;
    Ok(TrialResult {
        params: params.clone(),
        best_val_accuracy: outcome.best_val_accuracy(),
        test_accuracy: outcome.test_accuracy,
        best_epoch: outcome.best_epoch(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{load_dataset, split, DatasetSource, LoadOptions, SyntheticConfig};

    #[test]
    fn test_gen_variants_product() {
        let datasets = vec!["cora".to_string(), "cadets".to_string()];
        let variants = gen_variants(&datasets, &[ModelKind::Gcn, ModelKind::Gat], &[0, 1, 2]);
        assert_eq!(variants.len(), 12);
        assert_eq!(
            variants[0],
            Variant {
                dataset: "cora".to_string(),
                model: ModelKind::Gcn,
                seed: 0
            }
        );
        assert_eq!(variants[3].model, ModelKind::Gat);
        assert_eq!(variants[6].dataset, "cadets");
        assert_eq!(variants[11].key(), vec!["cadets".to_string(), "GAT".to_string()]);
    }

    #[test]
    fn test_sampling_is_seeded_and_in_space() {
        let space = SearchSpace::default();
        let first = space.sample_trials(20, 7).unwrap();
        assert_eq!(first, space.sample_trials(20, 7).unwrap());
        assert_ne!(first, space.sample_trials(20, 8).unwrap());

        for params in &first {
            assert!(space.num_layers.contains(&params.num_layers));
            assert!(space.embed_dim.contains(&params.embed_dim));
            assert!(space.learning_rate.contains(&params.learning_rate));
            assert!(space.weight_decay.contains(&params.weight_decay));
        }
    }

    #[test]
    fn test_empty_space_rejected() {
        let space = SearchSpace {
            embed_dim: vec![],
            ..SearchSpace::default()
        };
        assert!(matches!(
            space.sample_trials(3, 0),
            Err(DistillError::InvalidConfiguration(_))
        ));
    }

    fn fixture() -> (Dataset, DatasetSplit, ConfigTable) {
        let source = DatasetSource::Synthetic(SyntheticConfig {
            classes: 2,
            nodes_per_class: 10,
            feature_dim: 4,
            seed: 3,
            ..SyntheticConfig::default()
        });
        let dataset = load_dataset(&source, &LoadOptions::default()).unwrap();
        let split = split(&dataset.labels, &crate::data::SplitPolicy::Ratio { train_ratio: 0.6, val_ratio: 0.2 }, 0).unwrap();

        let mut base = ConfigTable::new();
        base.merge(
            serde_json::json!({
                "model_name": "SGC", "max_epoch": 5, "patience": 3, "division_seed": 0,
                "split": { "mode": "ratio", "train_ratio": 0.6, "val_ratio": 0.2 }
            })
            .as_object()
            .unwrap(),
        );
        (dataset, split, base)
    }

    #[test]
    fn test_search_sorts_by_validation_accuracy() {
        let (dataset, split, base) = fixture();
        let outcome = HyperparameterSearch::new(4, 2)
            .with_seed(1)
            .run(&dataset, &split, &base)
            .unwrap();

        assert_eq!(outcome.trials.len(), 4);
        assert_eq!(outcome.skipped, 0);
        for pair in outcome.trials.windows(2) {
            assert!(pair[0].best_val_accuracy >= pair[1].best_val_accuracy);
        }
        assert!(outcome.best().is_some());
    }

    #[test]
    fn test_configuration_errors_skip_trials() {
        let (dataset, split, mut base) = fixture();
        base.set("device", serde_json::json!("cuda"));
        let outcome = HyperparameterSearch::new(3, 1).run(&dataset, &split, &base).unwrap();
        assert!(outcome.trials.is_empty());
        assert_eq!(outcome.skipped, 3);
    }
}
