//! Tuned hyperparameters per (problem type, teacher, dataset)
//!
//! The provenance datasets share one tuned setting per dataset across every
//! teacher architecture; values are keyed the way they were recorded
//! (`emb_dim`, `lr`, `wd`, `feat_drop`) and normalized when merged.

use serde_json::{json, Map, Value};

use crate::models::ModelKind;

/// Problem type with tuned presets (inductive)
pub const INDUCTIVE: &str = "ind";

/// Datasets with tuned presets
pub const PRESET_DATASETS: [&str; 5] = ["cadets", "trace", "theia", "streamspot", "unicorn"];

/// Models with tuned presets
pub const PRESET_MODELS: [ModelKind; 5] = [
    ModelKind::Gcn,
    ModelKind::Gat,
    ModelKind::Appnp,
    ModelKind::GraphSage,
    ModelKind::Sgc,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preset {
    pub num_layers: usize,
    pub emb_dim: usize,
    pub feat_drop: f32,
    pub attn_drop: f32,
    pub beta: f32,
    pub lr: f32,
    pub wd: f32,
}

impl Preset {
    /// Raw key/value layer, keyed as recorded
    pub fn to_layer(&self) -> Map<String, Value> {
        let value = json!({
            "num_layers": self.num_layers,
            "emb_dim": self.emb_dim,
            "feat_drop": self.feat_drop,
            "attn_drop": self.attn_drop,
            "beta": self.beta,
            "lr": self.lr,
            "wd": self.wd,
        });
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Look up the tuned preset; `None` when the combination was never tuned
pub fn lookup(ptype: &str, model: ModelKind, dataset: &str) -> Option<Preset> {
    if ptype != INDUCTIVE || !PRESET_MODELS.contains(&model) {
        return None;
    }
    let preset = match dataset {
        "cadets" | "trace" => Preset {
            num_layers: 8,
            emb_dim: 32,
            feat_drop: 0.8,
            attn_drop: 0.2,
            beta: 0.0,
            lr: 0.001,
            wd: 0.01,
        },
        "theia" => Preset {
            num_layers: 6,
            emb_dim: 64,
            feat_drop: 0.8,
            attn_drop: 0.2,
            beta: 0.0,
            lr: 0.001,
            wd: 0.01,
        },
        "streamspot" => Preset {
            num_layers: 5,
            emb_dim: 8,
            feat_drop: 0.8,
            attn_drop: 0.2,
            beta: 0.0,
            lr: 0.001,
            wd: 0.01,
        },
        "unicorn" => Preset {
            num_layers: 10,
            emb_dim: 64,
            feat_drop: 0.5,
            attn_drop: 0.8,
            beta: 1.0,
            lr: 0.001,
            wd: 0.01,
        },
        _ => return None,
    };
    Some(preset)
}
