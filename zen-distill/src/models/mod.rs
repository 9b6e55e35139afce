/**
 * @file zen-distill/src/models/mod.rs
 * @brief Node-classification models behind a uniform interface
 *
 * Teacher models (GCN, GAT, GraphSAGE, SGC, APPNP) and the graph-free MLP
 * student all implement [`GraphModel`]: a full-graph forward pass returning
 * logits (plus attention for GAT), an analytic backward pass, and access to
 * the trainable parameter matrices in a fixed order.
 *
 * ## Usage
 *
 * ```rust
 * use ndarray::Array2;
 * use zen_distill::data::GraphData;
 * use zen_distill::models::{build_model, ModelKind, ModelSpec, TrainingMode};
 *
 * let graph = GraphData::new(Array2::ones((4, 3)), vec![(0, 1), (1, 0), (2, 3), (3, 2)]).unwrap();
 * let kind: ModelKind = "gcn".parse().unwrap();
 * let spec = ModelSpec::new(kind, 3, 2).with_hidden(8);
 * let mut model = build_model(&spec, 0).unwrap();
 *
 * let output = model.forward(&graph, TrainingMode::Inference).unwrap();
 * assert_eq!(output.logits.dim(), (4, 2));
 * ```
 */

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::data::GraphData;
use crate::errors::{DistillError, Result};

pub mod appnp;
pub mod gat;
pub mod gcn;
pub mod layers;
pub mod mlp;
pub mod sage;
pub mod sgc;

pub use appnp::Appnp;
pub use gat::Gat;
pub use gcn::Gcn;
pub use mlp::Mlp;
pub use sage::{GraphSage, SageAggregator};
pub use sgc::Sgc;

// === CORE TYPES ===

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "GCN")]
    Gcn,
    #[serde(rename = "GAT")]
    Gat,
    #[serde(rename = "GraphSAGE")]
    GraphSage,
    #[serde(rename = "SGC")]
    Sgc,
    #[serde(rename = "APPNP")]
    Appnp,
    #[serde(rename = "MLP")]
    Mlp,
}

impl ModelKind {
    pub const ALL: [ModelKind; 6] = [
        ModelKind::Gcn,
        ModelKind::Gat,
        ModelKind::GraphSage,
        ModelKind::Sgc,
        ModelKind::Appnp,
        ModelKind::Mlp,
    ];

    /// Canonical tag used in configs and output paths
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Gcn => "GCN",
            ModelKind::Gat => "GAT",
            ModelKind::GraphSage => "GraphSAGE",
            ModelKind::Sgc => "SGC",
            ModelKind::Appnp => "APPNP",
            ModelKind::Mlp => "MLP",
        }
    }

    /// Whether the model produces per-edge attention weights
    pub fn has_attention(&self) -> bool {
        matches!(self, ModelKind::Gat)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = DistillError;

    fn from_str(tag: &str) -> Result<Self> {
        ModelKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag.trim()))
            .ok_or_else(|| DistillError::UnsupportedModel(tag.to_string()))
    }
}

/// Whether dropout is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    Training,
    Inference,
}

/// Result of a full-graph forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Unnormalized class scores: [num_nodes, num_classes]
    pub logits: Array2<f32>,
    /// Per-edge attention of the last layer, aligned with
    /// [`GraphData::edges_with_self_loops`] (attention models only)
    pub attention: Option<Array1<f32>>,
}

impl ModelOutput {
    pub fn new(logits: Array2<f32>) -> Self {
        Self {
            logits,
            attention: None,
        }
    }
}

/**
 * Uniform interface the training loop drives.
 *
 * `forward` caches the activations of its last call; `backward` consumes
 * them and returns one gradient per parameter, in `parameters()` order.
 */
pub trait GraphModel: Send {
    fn kind(&self) -> ModelKind;

    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput>;

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>>;

    fn parameters(&self) -> Vec<&Array2<f32>>;

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>>;

    /// Total number of trainable scalars
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }
}

// === ARCHITECTURE SETTINGS ===

/// Architecture hyperparameters shared by every model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub in_dim: usize,
    pub num_classes: usize,
    /// Hidden width (per head for GAT)
    pub hidden: usize,
    /// Number of hidden layers
    pub num_layers: usize,
    /// Feature dropout rate
    pub dropout: f32,
    /// Attention dropout rate (GAT)
    pub attn_drop: f32,
    /// Attention heads of the hidden GAT layers
    pub num_heads: usize,
    pub aggregator: SageAggregator,
    /// Propagation steps (SGC, APPNP)
    pub k: Option<usize>,
    /// Teleport probability (APPNP)
    pub alpha: f32,
}

impl ModelSpec {
    /// Defaults per architecture, overridable through the `with_*` builders
    pub fn new(kind: ModelKind, in_dim: usize, num_classes: usize) -> Self {
        let (hidden, num_layers, dropout, attn_drop) = match kind {
            ModelKind::Gat => (8, 1, 0.6, 0.6),
            ModelKind::GraphSage => (16, 2, 0.5, 0.0),
            _ => (64, 1, 0.5, 0.0),
        };
        Self {
            kind,
            in_dim,
            num_classes,
            hidden,
            num_layers,
            dropout,
            attn_drop,
            num_heads: 8,
            aggregator: SageAggregator::Gcn,
            k: None,
            alpha: 0.1,
        }
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_num_layers(mut self, num_layers: usize) -> Self {
        self.num_layers = num_layers;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_attn_drop(mut self, attn_drop: f32) -> Self {
        self.attn_drop = attn_drop;
        self
    }

    pub fn with_num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn with_aggregator(mut self, aggregator: SageAggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_dim == 0 || self.num_classes == 0 {
            return Err(DistillError::InvalidConfiguration(format!(
                "Model needs positive input and output sizes (got {} -> {})",
                self.in_dim, self.num_classes
            )));
        }
        if self.hidden == 0 {
            return Err(DistillError::InvalidConfiguration(
                "Hidden width must be positive".to_string(),
            ));
        }
        for (name, rate) in [("dropout", self.dropout), ("attn_drop", self.attn_drop)] {
            if !(0.0..1.0).contains(&rate) {
                return Err(DistillError::InvalidConfiguration(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(DistillError::InvalidConfiguration(format!(
                "alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if self.kind == ModelKind::Gat && self.num_heads == 0 {
            return Err(DistillError::InvalidConfiguration(
                "GAT needs at least one attention head".to_string(),
            ));
        }
        Ok(())
    }
}

/// Build a freshly initialized model; `seed` drives weight init and dropout
pub fn build_model(spec: &ModelSpec, seed: u64) -> Result<Box<dyn GraphModel>> {
    spec.validate()?;
    let rng = ChaCha8Rng::seed_from_u64(seed);

    let model: Box<dyn GraphModel> = match spec.kind {
        ModelKind::Gcn => Box::new(Gcn::new(spec, rng)),
        ModelKind::Gat => Box::new(Gat::new(spec, rng)),
        ModelKind::GraphSage => Box::new(GraphSage::new(spec, rng)),
        ModelKind::Sgc => Box::new(Sgc::new(spec, rng)),
        ModelKind::Appnp => Box::new(Appnp::new(spec, rng)),
        ModelKind::Mlp => Box::new(Mlp::new(spec, rng)),
    };
    Ok(model)
}

// === TESTS ===
