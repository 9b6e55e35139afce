/**
 * @file zen-distill/src/experiment.rs
 * @brief One end-to-end run: split, train the teacher, optionally distill
 *
 * A run draws the split from `division_seed`, builds the configured model
 * from `seed`, trains it under the early-stopping loop and, in distillation
 * mode, trains the student against the restored teacher's outputs on the same
 * split. Outputs are written only after every stage has succeeded.
 */

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::config::ExperimentConfig;
use crate::data::{split, Dataset, DatasetSplit};
use crate::errors::Result;
use crate::models::{build_model, ModelKind};
use crate::report;
use crate::training::{
    DistillationObjective, EpochObserver, HardLabelObjective, LogObserver, Objective, TrainingLoop,
    TrainingOutcome,
};

/// One trained model and its outcome
#[derive(Debug, Clone)]
pub struct RunResult {
    pub model: ModelKind,
    pub outcome: TrainingOutcome,
}

#[derive(Debug, Clone)]
pub struct ExperimentResult {
    pub dataset: String,
    pub split: DatasetSplit,
    pub teacher: RunResult,
    /// Present in distillation mode
    pub student: Option<RunResult>,
}

impl ExperimentResult {
    /// The student when there is one, otherwise the teacher
    pub fn final_run(&self) -> &RunResult {
        self.student.as_ref().unwrap_or(&self.teacher)
    }

    pub fn test_accuracy(&self) -> f32 {
        self.final_run().outcome.test_accuracy
    }

    pub fn best_val_accuracy(&self) -> f32 {
        self.final_run().outcome.best_val_accuracy()
    }
}

/// `<root>/<dataset>/<model>/cascade_random_<division_seed>_<label_rate>`
pub fn output_dir(root: &Path, dataset: &str, model: ModelKind, division_seed: u64, label_rate: &str) -> PathBuf {
    root.join(dataset)
        .join(model.as_str())
        .join(format!("cascade_random_{}_{}", division_seed, label_rate))
}

/// Train one model on `split` with the given objective
pub fn train_model(
    dataset: &Dataset,
    split: &DatasetSplit,
    config: &ExperimentConfig,
    kind: ModelKind,
    objective: &dyn Objective,
    observer: &mut dyn EpochObserver,
) -> Result<RunResult> {
    let spec = config.model_spec(kind, dataset.feature_dim(), dataset.num_classes());
    let mut model = build_model(&spec, config.seed)?;
    let mut optimizer = config.optimizer_config()?.build()?;
    info!(
        "{} with {} parameters, lr {}, weight decay {}",
        kind,
        model.num_parameters(),
        config.learning_rate,
        config.weight_decay
    );

    let outcome = TrainingLoop::new(config.loop_config())?.run(
        model.as_mut(),
        optimizer.as_mut(),
        &dataset.graph,
        &dataset.labels,
        split,
        objective,
        observer,
    )?;
    info!(
        "{}: best epoch {} (val acc {:.4}), test acc {:.4}, test loss {:.4}, {:.2}s",
        kind,
        outcome.best_epoch(),
        outcome.best_val_accuracy(),
        outcome.test_accuracy,
        outcome.test_loss,
        outcome.elapsed.as_secs_f64()
    );
    Ok(RunResult { model: kind, outcome })
}

/// Draw the split and log its sizes
pub fn split_dataset(dataset: &Dataset, config: &ExperimentConfig) -> Result<DatasetSplit> {
    let split = split(&dataset.labels, &config.split, config.division_seed)?;
    info!(
        "Split (seed {}): {} train, {} val, {} test",
        config.division_seed,
        split.train.len(),
        split.val.len(),
        split.test.len()
    );
    Ok(split)
}

/// Run a configured experiment on a loaded dataset
pub fn run_experiment(dataset: &Dataset, config: &ExperimentConfig) -> Result<ExperimentResult> {
    let split = split_dataset(dataset, config)?;
    run_on_split(dataset, split, config, true)
}

/**
 * Run on a pre-drawn split.
 *
 * With `verbose` off, epochs are not logged; the search driver uses this to
 * keep concurrent trials quiet.
 */
pub fn run_on_split(
    dataset: &Dataset,
    split: DatasetSplit,
    config: &ExperimentConfig,
    verbose: bool,
) -> Result<ExperimentResult> {
    let label = |kind: ModelKind| format!("{}/{}/{}", dataset.name, kind, config.seed);
    let mut quiet = crate::training::NoopObserver;

    let teacher = {
        let mut observer = LogObserver::new(label(config.model_name));
        let observer: &mut dyn EpochObserver = if verbose { &mut observer } else { &mut quiet };
        train_model(dataset, &split, config, config.model_name, &HardLabelObjective, observer)?
    };

    let student = match &config.distill {
        Some(settings) => {
            let objective =
                DistillationObjective::new(&teacher.outcome.log_probs, settings.temperature, settings.alpha)?;
            info!(
                "Distilling {} into {} (temperature {}, alpha {})",
                teacher.model, settings.student, settings.temperature, settings.alpha
            );
            let mut observer = LogObserver::new(label(settings.student));
            let observer: &mut dyn EpochObserver = if verbose { &mut observer } else { &mut quiet };
            Some(train_model(dataset, &split, config, settings.student, &objective, observer)?)
        }
        None => None,
    };

    Ok(ExperimentResult {
        dataset: dataset.name.clone(),
        split,
        teacher,
        student,
    })
}

/**
 * Persist every trained model of `result` under `root`.
 *
 * Each model gets its own directory (see [`output_dir`]) holding the report
 * files and the resolved configuration as `config.json`. Returns the
 * directories written, teacher first.
 */
pub fn save_experiment(
    root: &Path,
    dataset: &Dataset,
    result: &ExperimentResult,
    config: &ExperimentConfig,
    label_rate: &str,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for run in std::iter::once(&result.teacher).chain(result.student.as_ref()) {
        let dir = output_dir(root, &result.dataset, run.model, config.division_seed, label_rate);
        report::write_outputs(&dir, &dataset.graph, &dataset.labels, &result.split.test, &run.outcome)?;
        fs::write(dir.join("config.json"), serde_json::to_string_pretty(config)?)?;
        info!("{} outputs written to {}", run.model, dir.display());
        written.push(dir);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTable;
    use crate::data::{load_dataset, DatasetSource, LoadOptions, SyntheticConfig};
    use serde_json::json;
    use tempfile::tempdir;

    fn dataset() -> Dataset {
        let source = DatasetSource::Synthetic(SyntheticConfig {
            classes: 2,
            nodes_per_class: 15,
            feature_dim: 4,
            p_in: 0.4,
            p_out: 0.02,
            noise: 0.3,
            seed: 1,
        });
        load_dataset(&source, &LoadOptions::default()).unwrap()
    }

    fn config(extra: serde_json::Value) -> ExperimentConfig {
        let mut table = ConfigTable::new();
        table.merge(
            json!({
                "model_name": "GCN", "max_epoch": 30, "patience": 10, "learning_rate": 0.01,
                "weight_decay": 0.0005, "division_seed": 0, "hidden": 8, "keep_cascade": true,
                "split": { "mode": "ratio", "train_ratio": 0.6, "val_ratio": 0.2 }
            })
            .as_object()
            .unwrap(),
        );
        table.merge(extra.as_object().unwrap());
        ExperimentConfig::from_table(&table).unwrap()
    }

    #[test]
    fn test_output_dir_layout() {
        let dir = output_dir(Path::new("outputs"), "cora", ModelKind::Gat, 3, "20");
        assert_eq!(dir, Path::new("outputs/cora/GAT/cascade_random_3_20"));
    }

    #[test]
    fn test_teacher_run_is_deterministic() {
        let data = dataset();
        let config = config(json!({}));
        let first = run_experiment(&data, &config).unwrap();
        let second = run_experiment(&data, &config).unwrap();

        assert!(first.student.is_none());
        assert_eq!(first.split, second.split);
        assert_eq!(first.teacher.outcome.val_history, second.teacher.outcome.val_history);
        assert_eq!(first.teacher.outcome.best_epoch(), second.teacher.outcome.best_epoch());
        assert!(first.test_accuracy() >= 0.0 && first.test_accuracy() <= 1.0);
    }

    #[test]
    fn test_distillation_trains_student_on_same_split() {
        let data = dataset();
        let config = config(json!({ "distill": true, "student": "MLP", "temperature": 2.0 }));
        let result = run_experiment(&data, &config).unwrap();

        let student = result.student.as_ref().unwrap();
        assert_eq!(student.model, ModelKind::Mlp);
        assert_eq!(result.final_run().model, ModelKind::Mlp);
        assert_eq!(result.teacher.model, ModelKind::Gcn);
    }

    #[test]
    fn test_save_experiment_writes_each_model() {
        let data = dataset();
        let config = config(json!({ "distill": true }));
        let result = run_experiment(&data, &config).unwrap();

        let root = tempdir().unwrap();
        let dirs = save_experiment(root.path(), &data, &result, &config, "0.8").unwrap();
        assert_eq!(dirs.len(), 2);
        for dir in &dirs {
            for file in [
                "test_nodes.txt",
                "preds.txt",
                "labels.txt",
                "output.txt",
                "test_acc.txt",
                "history.tsv",
                "config.json",
            ] {
                assert!(dir.join(file).is_file(), "missing {}", file);
            }
        }
        let preds = fs::read_to_string(dirs[0].join("preds.txt")).unwrap();
        assert_eq!(preds.lines().count(), result.split.test.len());
        let nodes: Vec<usize> = fs::read_to_string(dirs[0].join("test_nodes.txt"))
            .unwrap()
            .lines()
            .map(|line| line.parse().unwrap())
            .collect();
        assert_eq!(nodes, result.split.test.to_vec());
        let cascade = fs::read_dir(dirs[0].join("cascade")).unwrap().count();
        assert_eq!(cascade, result.teacher.outcome.best_epoch());
    }
}
