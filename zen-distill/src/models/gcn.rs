/**
 * @file zen-distill/src/models/gcn.rs
 * @brief Graph convolutional network (Kipf & Welling)
 *
 * Each layer computes `H' = Â H W + b` with the symmetrically normalized
 * adjacency `Â = D^{-1/2} (A + I) D^{-1/2}`. Hidden layers use ReLU and
 * dropout is applied to the input of every layer except the first.
 */

use std::sync::Arc;

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;

use super::layers::{relu, relu_backward, Dropout, Linear, OperatorCache};
use super::{GraphModel, ModelKind, ModelOutput, ModelSpec, TrainingMode};
use crate::data::{GraphData, SparseMatrix};
use crate::errors::{DistillError, Result};

pub struct Gcn {
    layers: Vec<Linear>,
    dropouts: Vec<Dropout>,
    operator: OperatorCache,
    rng: ChaCha8Rng,

    // Forward cache
    pre_activations: Vec<Array2<f32>>,
    operator_t: Option<Arc<SparseMatrix>>,
}

impl Gcn {
    pub fn new(spec: &ModelSpec, mut rng: ChaCha8Rng) -> Self {
        let mut dims = vec![spec.in_dim];
        dims.extend(std::iter::repeat(spec.hidden).take(spec.num_layers));
        dims.push(spec.num_classes);

        let layers: Vec<Linear> = dims
            .windows(2)
            .map(|pair| Linear::new(pair[0], pair[1], true, &mut rng))
            .collect();
        let dropouts = (0..layers.len())
            .map(|i| Dropout::new(if i == 0 { 0.0 } else { spec.dropout }))
            .collect();

        Self {
            layers,
            dropouts,
            operator: OperatorCache::default(),
            rng,
            pre_activations: Vec::new(),
            operator_t: None,
        }
    }
}

impl GraphModel for Gcn {
    fn kind(&self) -> ModelKind {
        ModelKind::Gcn
    }

    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput> {
        let (op, op_t) = self.operator.get(graph, GraphData::gcn_normalized);
        let last = self.layers.len() - 1;

        self.pre_activations.clear();
        let mut hidden = graph.node_features.clone();

        for (i, (layer, dropout)) in self.layers.iter_mut().zip(self.dropouts.iter_mut()).enumerate() {
            let dropped = dropout.forward(&hidden, mode, &mut self.rng);
            let aggregated = op.spmm(&dropped)?;
            let z = layer.forward(&aggregated)?;
            hidden = if i < last { relu(&z) } else { z.clone() };
            self.pre_activations.push(z);
        }

        self.operator_t = Some(op_t);
        Ok(ModelOutput::new(hidden))
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        let op_t = self.operator_t.as_ref().ok_or_else(|| {
            DistillError::InvalidInput("GCN backward called before forward".to_string())
        })?;
        let last = self.layers.len() - 1;

        let mut grads_per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_logits.clone();

        for i in (0..self.layers.len()).rev() {
            if i < last {
                grad = relu_backward(&grad, &self.pre_activations[i]);
            }
            let (grad_aggregated, grads) = self.layers[i].backward(&grad)?;
            grads_per_layer.push(grads);
            grad = self.dropouts[i].backward(&op_t.spmm(&grad_aggregated)?);
        }

        Ok(grads_per_layer.into_iter().rev().flatten().collect())
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        self.layers.iter().flat_map(Linear::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.layers.iter_mut().flat_map(Linear::parameters_mut).collect()
    }
}
