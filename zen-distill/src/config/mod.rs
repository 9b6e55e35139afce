//! Experiment configuration resolution
//!
//! A run's configuration is assembled from layered key/value tables, later
//! layers overriding earlier ones:
//!
//! 1. the tuned preset for `(ptype, teacher, dataset)`, when one exists
//! 2. the per-model training configuration (`train.conf.json`: a `global`
//!    section plus one section per model)
//! 3. the dataset configuration (`dataset.conf.json`; its `seed` becomes
//!    `division_seed`)
//! 4. command-line overrides
//!
//! Short aliases are normalized as layers are merged (`lr` → `learning_rate`,
//! `wd` → `weight_decay`, `emb_dim` → `embed_dim`, `feat_drop` → `dropout`).
//! [`ExperimentConfig::from_table`] then reads the typed configuration and
//! fails with `ConfigurationMissingKey` for any required key that no layer
//! provided.

use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::{LoadOptions, SplitPolicy};
use crate::errors::{DistillError, Result};
use crate::models::{ModelKind, ModelSpec, SageAggregator};
use crate::training::{LoopConfig, OptimizerConfig};

pub mod presets;

/// Keys that must be present after all layers are merged
pub const REQUIRED_KEYS: [&str; 7] = [
    "model_name",
    "max_epoch",
    "patience",
    "learning_rate",
    "weight_decay",
    "division_seed",
    "split",
];

/// Map a key alias to its canonical name
pub fn canonical_key(key: &str) -> &str {
    match key {
        "lr" => "learning_rate",
        "wd" => "weight_decay",
        "emb_dim" => "embed_dim",
        "feat_drop" => "dropout",
        "agg_type" => "aggregator",
        other => other,
    }
}

// === CONFIG TABLE ===

/// Flat key/value table with alias normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTable {
    entries: Map<String, Value>,
}

impl ConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay `layer` onto the table; nulls are ignored
    pub fn merge(&mut self, layer: &Map<String, Value>) {
        for (key, value) in layer {
            if !value.is_null() {
                self.set(key, value.clone());
            }
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(canonical_key(key).to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(canonical_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn entries(&self) -> &Map<String, Value> {
        &self.entries
    }

    /// Parse a `key=value` override; values are JSON when they parse as JSON
    pub fn set_override(&mut self, assignment: &str) -> Result<()> {
        let (key, raw) = assignment.split_once('=').ok_or_else(|| {
            DistillError::InvalidConfiguration(format!(
                "Override '{}' must have the form key=value",
                assignment
            ))
        })?;
        let value = serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.trim().to_string()));
        self.set(key.trim(), value);
        Ok(())
    }

    // --- typed access ---

    fn require(&self, key: &str) -> Result<&Value> {
        self.get(key)
            .ok_or_else(|| DistillError::ConfigurationMissingKey(canonical_key(key).to_string()))
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| invalid_type(key, "a non-negative integer", value))
            })
            .transpose()
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        Ok(self.get_u64(key)?.map(|v| v as usize))
    }

    pub fn get_f32(&self, key: &str) -> Result<Option<f32>> {
        self.get(key)
            .map(|value| {
                value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .map(|v| v as f32)
                    .ok_or_else(|| invalid_type(key, "a number", value))
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.get(key)
            .map(|value| {
                value
                    .as_bool()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| invalid_type(key, "a boolean", value))
            })
            .transpose()
    }

    pub fn get_str(&self, key: &str) -> Result<Option<String>> {
        self.get(key)
            .map(|value| match value {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(invalid_type(key, "a string", other)),
            })
            .transpose()
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.require(key)?;
        self.get_u64(key)?
            .ok_or_else(|| DistillError::ConfigurationMissingKey(key.to_string()))
    }

    pub fn require_usize(&self, key: &str) -> Result<usize> {
        Ok(self.require_u64(key)? as usize)
    }

    pub fn require_f32(&self, key: &str) -> Result<f32> {
        self.require(key)?;
        self.get_f32(key)?
            .ok_or_else(|| DistillError::ConfigurationMissingKey(key.to_string()))
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.require(key)?;
        self.get_str(key)?
            .ok_or_else(|| DistillError::ConfigurationMissingKey(key.to_string()))
    }
}

fn invalid_type(key: &str, expected: &str, value: &Value) -> DistillError {
    DistillError::InvalidConfiguration(format!(
        "Configuration key '{}' must be {}, got {}",
        canonical_key(key),
        expected,
        value
    ))
}

// === LAYER SOURCES ===

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(DistillError::InvalidConfiguration(format!(
            "{} must contain a JSON object",
            path.display()
        ))),
    }
}

/**
 * Training configuration for one model.
 *
 * The file holds a `global` section and one section per model tag; the
 * model section overrides `global`, and `model_name` is set to the
 * canonical tag. Section names match model tags case-insensitively.
 */
pub fn training_layer(document: &Map<String, Value>, model: ModelKind) -> Map<String, Value> {
    let mut layer = Map::new();
    if let Some(Value::Object(global)) = document.get("global") {
        layer.extend(global.clone());
    }
    let section = document
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(model.as_str()))
        .and_then(|(_, value)| value.as_object());
    if let Some(section) = section {
        layer.extend(section.clone());
    }
    layer.insert("model_name".to_string(), Value::String(model.as_str().to_string()));
    layer
}

pub fn load_training_layer(path: &Path, model: ModelKind) -> Result<Map<String, Value>> {
    Ok(training_layer(&read_json_object(path)?, model))
}

/// Dataset configuration layer: `seed` is the split seed
pub fn dataset_layer(document: &Map<String, Value>) -> Map<String, Value> {
    let mut layer = document.clone();
    if let Some(seed) = layer.remove("seed") {
        layer.insert("division_seed".to_string(), seed);
    }
    layer
}

pub fn load_dataset_layer(path: &Path) -> Result<Map<String, Value>> {
    Ok(dataset_layer(&read_json_object(path)?))
}

// === RESOLVER ===

/// Builder collecting configuration layers in precedence order
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    preset: Option<Map<String, Value>>,
    training: Option<Map<String, Value>>,
    dataset: Option<Map<String, Value>>,
    overrides: Map<String, Value>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the tuned preset for this combination, if one exists
    pub fn with_preset(mut self, ptype: &str, model: ModelKind, dataset: &str) -> Self {
        self.preset = presets::lookup(ptype, model, dataset).map(|preset| preset.to_layer());
        if self.preset.is_none() {
            debug!("No preset for ({}, {}, {})", ptype, model, dataset);
        }
        self
    }

    pub fn with_training(mut self, layer: Map<String, Value>) -> Self {
        self.training = Some(layer);
        self
    }

    pub fn with_dataset(mut self, layer: Map<String, Value>) -> Self {
        self.dataset = Some(layer);
        self
    }

    pub fn with_override(mut self, key: &str, value: Value) -> Self {
        self.overrides.insert(key.to_string(), value);
        self
    }

    pub fn with_overrides(mut self, overrides: Map<String, Value>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Merged table, before typing
    pub fn table(&self) -> ConfigTable {
        let mut table = ConfigTable::new();
        for layer in [&self.preset, &self.training, &self.dataset].into_iter().flatten() {
            table.merge(layer);
        }
        table.merge(&self.overrides);
        table
    }

    pub fn resolve(&self) -> Result<ExperimentConfig> {
        ExperimentConfig::from_table(&self.table())
    }
}

// === TYPED CONFIGURATION ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillSettings {
    pub student: ModelKind,
    pub temperature: f32,
    pub alpha: f32,
}

/// Fully resolved experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub model_name: ModelKind,
    pub max_epoch: usize,
    pub patience: usize,
    pub learning_rate: f32,
    pub weight_decay: f32,
    pub division_seed: u64,
    /// Seed for weight initialization and dropout
    pub seed: u64,

    pub dropout: Option<f32>,
    pub attn_drop: Option<f32>,
    pub hidden: Option<usize>,
    pub embed_dim: Option<usize>,
    pub num_layers: Option<usize>,
    pub num_heads: Option<usize>,
    pub aggregator: Option<SageAggregator>,
    pub k: Option<usize>,
    pub alpha: Option<f32>,
    pub momentum: Option<f32>,
    pub optimizer: String,

    pub split: SplitPolicy,
    pub load: LoadOptions,
    pub keep_cascade: bool,
    pub distill: Option<DistillSettings>,
}

impl ExperimentConfig {
    pub fn from_table(table: &ConfigTable) -> Result<Self> {
        for key in REQUIRED_KEYS {
            if !table.contains(key) {
                return Err(DistillError::ConfigurationMissingKey(key.to_string()));
            }
        }

        let model_name: ModelKind = table.require_str("model_name")?.parse()?;

        if let Some(device) = table.get_str("device")? {
            if !device.eq_ignore_ascii_case("cpu") {
                return Err(DistillError::InvalidConfiguration(format!(
                    "Only cpu execution is supported, got device '{}'",
                    device
                )));
            }
        }

        let split: SplitPolicy = serde_json::from_value(table.require("split")?.clone())
            .map_err(|e| DistillError::InvalidConfiguration(format!("Invalid split policy: {}", e)))?;
        split.validate()?;

        let aggregator = table
            .get_str("aggregator")?
            .map(|name| name.parse::<SageAggregator>())
            .transpose()?;

        let distill = if table.get_bool("distill")?.unwrap_or(false) {
            Some(DistillSettings {
                student: table
                    .get_str("student")?
                    .map(|tag| tag.parse())
                    .transpose()?
                    .unwrap_or(ModelKind::Mlp),
                temperature: table.get_f32("temperature")?.unwrap_or(1.0),
                alpha: table.get_f32("distill_alpha")?.unwrap_or(0.5),
            })
        } else {
            None
        };

        let config = Self {
            model_name,
            max_epoch: table.require_usize("max_epoch")?,
            patience: table.require_usize("patience")?,
            learning_rate: table.require_f32("learning_rate")?,
            weight_decay: table.require_f32("weight_decay")?,
            division_seed: table.require_u64("division_seed")?,
            seed: table.get_u64("seed")?.unwrap_or(0),
            dropout: table.get_f32("dropout")?,
            attn_drop: table.get_f32("attn_drop")?,
            hidden: table.get_usize("hidden")?,
            embed_dim: table.get_usize("embed_dim")?,
            num_layers: table.get_usize("num_layers")?,
            num_heads: table.get_usize("num_heads")?,
            aggregator,
            k: table.get_usize("k")?,
            alpha: table.get_f32("alpha")?,
            momentum: table.get_f32("momentum")?,
            optimizer: table.get_str("optimizer")?.unwrap_or_else(|| "adam".to_string()),
            split,
            load: LoadOptions {
                largest_component: table.get_bool("largest_component")?.unwrap_or(false),
                row_normalize: table.get_bool("row_normalize")?.unwrap_or(false),
            },
            keep_cascade: table.get_bool("keep_cascade")?.unwrap_or(false),
            distill,
        };
        config.optimizer_config()?;
        Ok(config)
    }

    /// Architecture for `kind` on a dataset with the given shape
    pub fn model_spec(&self, kind: ModelKind, in_dim: usize, num_classes: usize) -> ModelSpec {
        let mut spec = ModelSpec::new(kind, in_dim, num_classes);

        let width = match kind {
            ModelKind::GraphSage => self.embed_dim.or(self.hidden),
            ModelKind::Gat => self.hidden,
            _ => self.hidden.or(self.embed_dim),
        };
        if let Some(width) = width {
            spec = spec.with_hidden(width);
        }
        if let Some(num_layers) = self.num_layers {
            spec = spec.with_num_layers(num_layers);
        }
        if let Some(dropout) = self.dropout {
            spec = spec.with_dropout(dropout);
        }
        if let Some(attn_drop) = self.attn_drop {
            spec = spec.with_attn_drop(attn_drop);
        }
        if let Some(num_heads) = self.num_heads {
            spec = spec.with_num_heads(num_heads);
        }
        if let Some(aggregator) = self.aggregator {
            spec = spec.with_aggregator(aggregator);
        }
        if let Some(k) = self.k {
            spec = spec.with_k(k);
        }
        if let Some(alpha) = self.alpha {
            spec = spec.with_alpha(alpha);
        }
        spec
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig::new(self.max_epoch, self.patience).with_cascade(self.keep_cascade)
    }

    pub fn optimizer_config(&self) -> Result<OptimizerConfig> {
        match self.optimizer.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerConfig::Adam {
                learning_rate: self.learning_rate,
                weight_decay: self.weight_decay,
            }),
            "sgd" => Ok(OptimizerConfig::Sgd {
                learning_rate: self.learning_rate,
                momentum: self.momentum.unwrap_or(0.0),
                weight_decay: self.weight_decay,
            }),
            other => Err(DistillError::InvalidConfiguration(format!(
                "Unknown optimizer '{}' (expected adam or sgd)",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn training_document() -> Map<String, Value> {
        object(json!({
            "global": { "seed": 0, "max_epoch": 500, "patience": 50, "device": "cpu" },
            "GCN": { "hidden": 64, "dropout": 0.5, "learning_rate": 0.01, "weight_decay": 0.0005 },
            "GraphSAGE": { "embed_dim": 128, "agg_type": "gcn", "lr": 0.01, "wd": 0.0005 }
        }))
    }

    fn ratio_split() -> Value {
        json!({ "mode": "ratio", "train_ratio": 0.8, "val_ratio": 0.1 })
    }

    #[test]
    fn test_layers_override_in_order() {
        let config = ConfigResolver::new()
            .with_preset("ind", ModelKind::Gcn, "cadets")
            .with_training(training_layer(&training_document(), ModelKind::Gcn))
            .with_dataset(dataset_layer(&object(json!({ "seed": 3, "split": ratio_split() }))))
            .with_override("lr", json!(0.05))
            .resolve()
            .unwrap();

        assert_eq!(config.model_name, ModelKind::Gcn);
        assert_eq!(config.max_epoch, 500);
        assert_eq!(config.division_seed, 3);
        // training layer beats the preset, the CLI beats both
        assert_eq!(config.dropout, Some(0.5));
        assert_eq!(config.weight_decay, 0.0005);
        assert_eq!(config.learning_rate, 0.05);
        // preset-only keys survive
        assert_eq!(config.num_layers, Some(8));
        assert_eq!(config.embed_dim, Some(32));
    }

    #[test]
    fn test_aliases_are_normalized() {
        let table = ConfigResolver::new()
            .with_training(training_layer(&training_document(), ModelKind::GraphSage))
            .with_dataset(dataset_layer(&object(json!({ "seed": 0, "split": ratio_split() }))))
            .table();
        assert!(table.contains("learning_rate"));
        assert!(table.contains("lr"));
        assert!(!table.entries().contains_key("wd"));

        let config = ExperimentConfig::from_table(&table).unwrap();
        assert_eq!(config.aggregator, Some(SageAggregator::Gcn));
        assert_eq!(config.model_spec(ModelKind::GraphSage, 10, 3).hidden, 128);
    }

    #[test]
    fn test_missing_required_key() {
        let mut table = ConfigTable::new();
        table.merge(&object(json!({
            "model_name": "GCN", "max_epoch": 10, "learning_rate": 0.01,
            "weight_decay": 0.0, "division_seed": 0
        })));
        match ExperimentConfig::from_table(&table) {
            Err(DistillError::ConfigurationMissingKey(key)) => assert_eq!(key, "patience"),
            other => panic!("expected ConfigurationMissingKey, got {:?}", other),
        }

        // the dataset seed is the only source of division_seed
        let result = ConfigResolver::new()
            .with_training(training_layer(&training_document(), ModelKind::Gcn))
            .resolve();
        assert!(matches!(result, Err(DistillError::ConfigurationMissingKey(key)) if key == "division_seed"));
    }

    #[test]
    fn test_missing_split_is_not_defaulted() {
        let resolver = ConfigResolver::new()
            .with_training(training_layer(&training_document(), ModelKind::Gcn))
            .with_dataset(dataset_layer(&object(json!({ "seed": 0 }))));
        let table = resolver.table();
        for key in REQUIRED_KEYS.iter().filter(|&&key| key != "split") {
            assert!(table.contains(key), "{}", key);
        }
        assert!(matches!(
            resolver.clone().resolve(),
            Err(DistillError::ConfigurationMissingKey(key)) if key == "split"
        ));

        let config = resolver.with_override("split", ratio_split()).resolve().unwrap();
        assert_eq!(
            config.split,
            SplitPolicy::Ratio {
                train_ratio: 0.8,
                val_ratio: 0.1
            }
        );
    }

    #[test]
    fn test_unsupported_model_and_device() {
        let mut table = ConfigTable::new();
        table.merge(&object(json!({
            "model_name": "GIN", "max_epoch": 10, "patience": 2, "learning_rate": 0.01,
            "weight_decay": 0.0, "division_seed": 0, "split": ratio_split()
        })));
        assert!(matches!(
            ExperimentConfig::from_table(&table),
            Err(DistillError::UnsupportedModel(_))
        ));

        table.set("model_name", json!("gcn"));
        table.set("device", json!("cuda:0"));
        assert!(matches!(
            ExperimentConfig::from_table(&table),
            Err(DistillError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_overrides_parse_json_or_strings() {
        let mut table = ConfigTable::new();
        table.set_override("patience=7").unwrap();
        table.set_override("student = MLP").unwrap();
        table.set_override("split={\"mode\":\"ratio\",\"train_ratio\":0.6,\"val_ratio\":0.2}").unwrap();
        assert!(table.set_override("novalue").is_err());

        assert_eq!(table.get_usize("patience").unwrap(), Some(7));
        assert_eq!(table.get_str("student").unwrap().as_deref(), Some("MLP"));
        assert!(table.get("split").unwrap().is_object());
        assert!(table.get_usize("student").is_err());
    }

    #[test]
    fn test_distill_settings_and_split() {
        let mut table = ConfigTable::new();
        table.merge(&object(json!({
            "model_name": "GAT", "max_epoch": 10, "patience": 2, "lr": 0.01, "wd": 0.0,
            "division_seed": 1, "distill": true, "temperature": 2.0,
            "split": { "mode": "per_class_count", "train_per_class": 20, "val_per_class": 30 }
        })));
        let config = ExperimentConfig::from_table(&table).unwrap();
        let distill = config.distill.unwrap();
        assert_eq!(distill.student, ModelKind::Mlp);
        assert_eq!(distill.temperature, 2.0);
        assert_eq!(config.split.label_rate(), "20");
    }

    #[test]
    fn test_files_on_disk() {
        let dir = tempdir().unwrap();
        let train_path = dir.path().join("train.conf.json");
        let data_path = dir.path().join("dataset.conf.json");
        fs::write(&train_path, Value::Object(training_document()).to_string()).unwrap();
        fs::write(
            &data_path,
            r#"{"seed": 4, "largest_component": true, "split": {"mode": "ratio", "train_ratio": 0.6, "val_ratio": 0.2}}"#,
        )
        .unwrap();

        let config = ConfigResolver::new()
            .with_training(load_training_layer(&train_path, ModelKind::Gcn).unwrap())
            .with_dataset(load_dataset_layer(&data_path).unwrap())
            .resolve()
            .unwrap();
        assert_eq!(config.division_seed, 4);
        assert!(config.load.largest_component);

        fs::write(&data_path, "[1, 2]").unwrap();
        assert!(load_dataset_layer(&data_path).is_err());
    }
}
