//! Multi-layer perceptron: the graph-free student model
//!
//! [`MlpStack`] is also the feature transform inside APPNP.

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;

use super::layers::{relu, relu_backward, Dropout, Linear};
use super::{GraphModel, ModelKind, ModelOutput, ModelSpec, TrainingMode};
use crate::data::GraphData;
use crate::errors::Result;

/// Linear layers with ReLU between them and dropout on layer inputs
pub struct MlpStack {
    layers: Vec<Linear>,
    dropouts: Vec<Dropout>,
    pre_activations: Vec<Array2<f32>>,
}

impl MlpStack {
    /// `input_dropout` controls whether the first layer's input is dropped too
    pub fn new(spec: &ModelSpec, input_dropout: bool, rng: &mut ChaCha8Rng) -> Self {
        let mut dims = vec![spec.in_dim];
        dims.extend(std::iter::repeat(spec.hidden).take(spec.num_layers));
        dims.push(spec.num_classes);

        let layers: Vec<Linear> = dims
            .windows(2)
            .map(|pair| Linear::new(pair[0], pair[1], true, rng))
            .collect();
        let dropouts = (0..layers.len())
            .map(|i| {
                let rate = if i == 0 && !input_dropout { 0.0 } else { spec.dropout };
                Dropout::new(rate)
            })
            .collect();

        Self {
            layers,
            dropouts,
            pre_activations: Vec::new(),
        }
    }

    pub fn forward(&mut self, input: &Array2<f32>, mode: TrainingMode, rng: &mut ChaCha8Rng) -> Result<Array2<f32>> {
        let last = self.layers.len() - 1;
        self.pre_activations.clear();

        let mut hidden = input.clone();
        for (i, (layer, dropout)) in self.layers.iter_mut().zip(self.dropouts.iter_mut()).enumerate() {
            let dropped = dropout.forward(&hidden, mode, rng);
            let z = layer.forward(&dropped)?;
            hidden = if i < last { relu(&z) } else { z.clone() };
            self.pre_activations.push(z);
        }
        Ok(hidden)
    }

    pub fn backward(&self, grad_output: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        let last = self.layers.len() - 1;
        let mut grads_per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_output.clone();

        for i in (0..self.layers.len()).rev() {
            if i < last {
                grad = relu_backward(&grad, &self.pre_activations[i]);
            }
            let (grad_input, grads) = self.layers[i].backward(&grad)?;
            grads_per_layer.push(grads);
            grad = self.dropouts[i].backward(&grad_input);
        }

        Ok(grads_per_layer.into_iter().rev().flatten().collect())
    }

    pub fn parameters(&self) -> Vec<&Array2<f32>> {
        self.layers.iter().flat_map(Linear::parameters).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.layers.iter_mut().flat_map(Linear::parameters_mut).collect()
    }
}

pub struct Mlp {
    stack: MlpStack,
    rng: ChaCha8Rng,
}

impl Mlp {
    pub fn new(spec: &ModelSpec, mut rng: ChaCha8Rng) -> Self {
        let stack = MlpStack::new(spec, false, &mut rng);
        Self { stack, rng }
    }
}

impl GraphModel for Mlp {
    fn kind(&self) -> ModelKind {
        ModelKind::Mlp
    }

    /// Uses node features only; edges are ignored
    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput> {
        let logits = self.stack.forward(&graph.node_features, mode, &mut self.rng)?;
        Ok(ModelOutput::new(logits))
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        self.stack.backward(grad_logits)
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        self.stack.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.stack.parameters_mut()
    }
}
