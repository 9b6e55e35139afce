/**
 * @file zen-distill/src/models/sage.rs
 * @brief GraphSAGE with `mean` and `gcn` neighborhood aggregators
 *
 * - `mean`: `H' = H W_self + mean_{u ∈ N(v)}(H_u) W_neigh + b`
 * - `gcn`:  `H' = mean_{u ∈ N(v) ∪ {v}}(H_u) W_neigh + b`
 *
 * Dropout is applied to the input of every layer; hidden layers use ReLU.
 */

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::layers::{relu, relu_backward, Dropout, Linear, OperatorCache};
use super::{GraphModel, ModelKind, ModelOutput, ModelSpec, TrainingMode};
use crate::data::{GraphData, SparseMatrix};
use crate::errors::{DistillError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SageAggregator {
    Mean,
    Gcn,
}

impl fmt::Display for SageAggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SageAggregator::Mean => f.write_str("mean"),
            SageAggregator::Gcn => f.write_str("gcn"),
        }
    }
}

impl FromStr for SageAggregator {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(SageAggregator::Mean),
            "gcn" => Ok(SageAggregator::Gcn),
            other => Err(DistillError::InvalidConfiguration(format!(
                "Unknown GraphSAGE aggregator '{}' (expected mean or gcn)",
                other
            ))),
        }
    }
}

struct SageLayer {
    fc_self: Option<Linear>,
    fc_neigh: Linear,
    dropout: Dropout,
}

impl SageLayer {
    fn parameters(&self) -> Vec<&Array2<f32>> {
        let mut params: Vec<&Array2<f32>> = self.fc_self.iter().flat_map(Linear::parameters).collect();
        params.extend(self.fc_neigh.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        let mut params: Vec<&mut Array2<f32>> =
            self.fc_self.iter_mut().flat_map(Linear::parameters_mut).collect();
        params.extend(self.fc_neigh.parameters_mut());
        params
    }
}

pub struct GraphSage {
    aggregator: SageAggregator,
    layers: Vec<SageLayer>,
    operator: OperatorCache,
    rng: ChaCha8Rng,

    pre_activations: Vec<Array2<f32>>,
    operator_t: Option<Arc<SparseMatrix>>,
}

impl GraphSage {
    pub fn new(spec: &ModelSpec, mut rng: ChaCha8Rng) -> Self {
        let mut dims = vec![spec.in_dim];
        dims.extend(std::iter::repeat(spec.hidden).take(spec.num_layers));
        dims.push(spec.num_classes);

        let layers = dims
            .windows(2)
            .map(|pair| SageLayer {
                fc_self: (spec.aggregator == SageAggregator::Mean)
                    .then(|| Linear::new(pair[0], pair[1], false, &mut rng)),
                fc_neigh: Linear::new(pair[0], pair[1], true, &mut rng),
                dropout: Dropout::new(spec.dropout),
            })
            .collect();

        Self {
            aggregator: spec.aggregator,
            layers,
            operator: OperatorCache::default(),
            rng,
            pre_activations: Vec::new(),
            operator_t: None,
        }
    }

    pub fn aggregator(&self) -> SageAggregator {
        self.aggregator
    }
}

impl GraphModel for GraphSage {
    fn kind(&self) -> ModelKind {
        ModelKind::GraphSage
    }

    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput> {
        let (op, op_t) = match self.aggregator {
            SageAggregator::Mean => self.operator.get(graph, GraphData::mean_aggregator),
            SageAggregator::Gcn => self.operator.get(graph, GraphData::gcn_aggregator),
        };
        let last = self.layers.len() - 1;

        self.pre_activations.clear();
        let mut hidden = graph.node_features.clone();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let dropped = layer.dropout.forward(&hidden, mode, &mut self.rng);
            let neighborhood = op.spmm(&dropped)?;
            let mut z = layer.fc_neigh.forward(&neighborhood)?;
            if let Some(fc_self) = layer.fc_self.as_mut() {
                z += &fc_self.forward(&dropped)?;
            }
            hidden = if i < last { relu(&z) } else { z.clone() };
            self.pre_activations.push(z);
        }

        self.operator_t = Some(op_t);
        Ok(ModelOutput::new(hidden))
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        let op_t = self.operator_t.as_ref().ok_or_else(|| {
            DistillError::InvalidInput("GraphSAGE backward called before forward".to_string())
        })?;
        let last = self.layers.len() - 1;

        let mut grads_per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_logits.clone();
        for i in (0..self.layers.len()).rev() {
            if i < last {
                grad = relu_backward(&grad, &self.pre_activations[i]);
            }
            let layer = &self.layers[i];
            let (grad_neigh, neigh_grads) = layer.fc_neigh.backward(&grad)?;
            let mut grad_dropped = op_t.spmm(&grad_neigh)?;

            let mut layer_grads = Vec::new();
            if let Some(fc_self) = &layer.fc_self {
                let (grad_self, self_grads) = fc_self.backward(&grad)?;
                grad_dropped += &grad_self;
                layer_grads.extend(self_grads);
            }
            layer_grads.extend(neigh_grads);
            grads_per_layer.push(layer_grads);

            grad = layer.dropout.backward(&grad_dropped);
        }

        Ok(grads_per_layer.into_iter().rev().flatten().collect())
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        self.layers.iter().flat_map(SageLayer::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.layers.iter_mut().flat_map(SageLayer::parameters_mut).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{check_gradients, two_cluster_graph};
    use rand::SeedableRng;

    #[test]
    fn test_aggregator_parsing() {
        assert_eq!("MEAN".parse::<SageAggregator>().unwrap(), SageAggregator::Mean);
        assert_eq!(SageAggregator::Gcn.to_string(), "gcn");
        assert!("lstm".parse::<SageAggregator>().is_err());
    }

    #[test]
    fn test_mean_aggregator_has_self_weights() {
        let spec = ModelSpec::new(ModelKind::GraphSage, 4, 2)
            .with_hidden(3)
            .with_num_layers(1)
            .with_aggregator(SageAggregator::Mean);
        let model = GraphSage::new(&spec, ChaCha8Rng::seed_from_u64(0));
        assert_eq!(model.parameters().len(), 6);

        let spec = spec.with_aggregator(SageAggregator::Gcn);
        let model = GraphSage::new(&spec, ChaCha8Rng::seed_from_u64(0));
        assert_eq!(model.parameters().len(), 4);
    }

    #[test]
    fn test_sage_gradients() {
        for aggregator in [SageAggregator::Mean, SageAggregator::Gcn] {
            let spec = ModelSpec::new(ModelKind::GraphSage, 4, 2)
                .with_hidden(3)
                .with_aggregator(aggregator);
            let mut model = GraphSage::new(&spec, ChaCha8Rng::seed_from_u64(8));
            check_gradients(&mut model, &two_cluster_graph());
        }
    }
}
