//! Config files → dataset → training → persisted outputs

use std::fs;
use std::path::Path;

use serde_json::json;
use tempfile::tempdir;

use zen_distill::config::{load_dataset_layer, load_training_layer};
use zen_distill::data::{load_dataset, DatasetSource, SYNTHETIC};
use zen_distill::experiment::output_dir;
use zen_distill::models::ModelKind;
use zen_distill::{
    gen_variants, run_experiment, save_experiment, ConfigResolver, DistillError, ExperimentConfig, ResultTable,
    TableFormat,
};

fn write_configs(dir: &Path) {
    fs::write(
        dir.join("train.conf.json"),
        json!({
            "global": { "seed": 0, "device": "cpu", "max_epoch": 25, "patience": 5 },
            "GAT": { "hidden": 4, "num_heads": 2, "learning_rate": 0.01, "weight_decay": 0.0005 },
            "MLP": { "hidden": 16, "learning_rate": 0.01, "weight_decay": 0.0005 }
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("dataset.conf.json"),
        json!({ "seed": 2, "split": { "mode": "ratio", "train_ratio": 0.6, "val_ratio": 0.2 } }).to_string(),
    )
    .unwrap();
}

fn resolve(dir: &Path, model: ModelKind) -> ConfigResolver {
    ConfigResolver::new()
        .with_preset("ind", model, SYNTHETIC)
        .with_training(load_training_layer(&dir.join("train.conf.json"), model).unwrap())
        .with_dataset(load_dataset_layer(&dir.join("dataset.conf.json")).unwrap())
}

#[test]
fn teacher_run_writes_every_output_file() {
    let configs = tempdir().unwrap();
    let outputs = tempdir().unwrap();
    write_configs(configs.path());

    let config = resolve(configs.path(), ModelKind::Gat)
        .with_override("keep_cascade", json!(true))
        .resolve()
        .unwrap();
    assert_eq!(config.division_seed, 2);

    let dataset = load_dataset(
        &DatasetSource::locate(Path::new("unused"), SYNTHETIC).unwrap(),
        &config.load,
    )
    .unwrap();
    let result = run_experiment(&dataset, &config).unwrap();
    let dirs = save_experiment(outputs.path(), &dataset, &result, &config, &config.split.label_rate()).unwrap();

    let expected = output_dir(outputs.path(), "synthetic", ModelKind::Gat, 2, "0.6");
    assert_eq!(dirs, vec![expected.clone()]);

    let num_nodes = dataset.graph.num_nodes();
    let read_column = |file: &str| -> Vec<usize> {
        fs::read_to_string(expected.join(file))
            .unwrap()
            .lines()
            .map(|line| line.parse().unwrap())
            .collect()
    };
    let test_nodes = read_column("test_nodes.txt");
    let preds = read_column("preds.txt");
    let labels = read_column("labels.txt");
    assert_eq!(test_nodes, result.split.test.to_vec());
    assert_eq!(preds.len(), test_nodes.len());
    let expected_labels: Vec<usize> = test_nodes.iter().map(|&node| dataset.labels.as_slice()[node]).collect();
    assert_eq!(labels, expected_labels);

    // the rows are exactly the ones scored by the test accuracy
    let correct = preds.iter().zip(&labels).filter(|(p, l)| p == l).count();
    assert!((correct as f32 / test_nodes.len() as f32 - result.test_accuracy()).abs() < 1e-4);

    let output = fs::read_to_string(expected.join("output.txt")).unwrap();
    assert_eq!(output.lines().count(), test_nodes.len());
    for line in output.lines() {
        let row: Vec<f32> = line.split('\t').map(|v| v.parse().unwrap()).collect();
        assert_eq!(row.len(), dataset.num_classes());
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-2);
    }

    let test_acc = fs::read_to_string(expected.join("test_acc.txt")).unwrap();
    assert_eq!(test_acc.trim(), format!("{:.4}", result.test_accuracy()));

    let attention = fs::read_to_string(expected.join("attention_weight.txt")).unwrap();
    assert_eq!(attention.lines().count(), dataset.graph.num_edges() + num_nodes);

    let history = fs::read_to_string(expected.join("history.tsv")).unwrap();
    assert_eq!(history.lines().count(), result.teacher.outcome.stopped_at + 1);
    assert_eq!(
        fs::read_dir(expected.join("cascade")).unwrap().count(),
        result.teacher.outcome.best_epoch()
    );
}

#[test]
fn distillation_across_seeds_fills_the_result_table() {
    let configs = tempdir().unwrap();
    write_configs(configs.path());

    let base = resolve(configs.path(), ModelKind::Gat)
        .with_override("distill", json!(true))
        .with_override("student", json!("mlp"));

    let dataset = load_dataset(
        &DatasetSource::locate(Path::new("unused"), SYNTHETIC).unwrap(),
        &Default::default(),
    )
    .unwrap();

    let mut table = ResultTable::new(&["dataset", "model"]);
    for variant in gen_variants(&[dataset.name.clone()], &[ModelKind::Gat], &[0, 1]) {
        let config = base.clone().with_override("seed", json!(variant.seed)).resolve().unwrap();
        let result = run_experiment(&dataset, &config).unwrap();
        assert_eq!(result.final_run().model, ModelKind::Mlp);
        table.record(vec![variant.dataset.clone(), result.final_run().model.to_string()], result.test_accuracy());
    }

    assert_eq!(table.len(), 1);
    let rendered = table.render(TableFormat::Github);
    assert!(rendered.contains("| synthetic"));
    assert!(rendered.contains("MLP"));
}

#[test]
fn missing_dataset_seed_is_reported() {
    let configs = tempdir().unwrap();
    write_configs(configs.path());
    fs::write(configs.path().join("dataset.conf.json"), "{}").unwrap();

    let err = ExperimentConfig::from_table(&resolve(configs.path(), ModelKind::Mlp).table()).unwrap_err();
    assert!(matches!(err, DistillError::ConfigurationMissingKey(key) if key == "division_seed"));
}
