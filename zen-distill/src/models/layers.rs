/**
 * @file zen-distill/src/models/layers.rs
 * @brief Shared building blocks for the node-classification models
 *
 * Dense linear transforms, seeded dropout, activations and a cache for the
 * sparse propagation operators. Every block caches what its backward pass
 * needs during `forward` and returns gradients aligned with its parameters.
 */

use std::sync::Arc;

use ndarray::{Array2, Axis};
use ndarray_rand::RandomExt;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::Uniform;

use super::TrainingMode;
use crate::data::{GraphData, SparseMatrix};
use crate::errors::{DistillError, Result};

// === INITIALIZATION ===

/// Xavier/Glorot uniform initialization: `U(-l, l)` with `l = sqrt(6 / (fan_in + fan_out))`
pub fn xavier_uniform(shape: (usize, usize), rng: &mut ChaCha8Rng) -> Array2<f32> {
    let (rows, cols) = shape;
    if rows + cols == 0 {
        return Array2::zeros(shape);
    }
    let limit = (6.0 / (rows + cols) as f32).sqrt();
    Array2::random_using(shape, Uniform::new_inclusive(-limit, limit), rng)
}

// === LINEAR ===

/// Dense affine transform `x · W + b`
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Array2<f32>,
    /// Row vector `[1, out_dim]`
    pub bias: Option<Array2<f32>>,
    input: Option<Array2<f32>>,
}

impl Linear {
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, rng: &mut ChaCha8Rng) -> Self {
        Self {
            weight: xavier_uniform((in_dim, out_dim), rng),
            bias: bias.then(|| Array2::zeros((1, out_dim))),
            input: None,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn forward(&mut self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let output = self.apply(input)?;
        self.input = Some(input.clone());
        Ok(output)
    }

    /// Forward without caching, for inputs that never need gradients
    pub fn apply(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        if input.ncols() != self.in_dim() {
            return Err(DistillError::DimensionMismatch(format!(
                "Linear layer expects {} input features, got {}",
                self.in_dim(),
                input.ncols()
            )));
        }
        let mut output = input.dot(&self.weight);
        if let Some(bias) = &self.bias {
            output += bias;
        }
        Ok(output)
    }

    /**
     * Backpropagate through the last cached forward.
     *
     * Returns the gradient w.r.t. the input and the parameter gradients in
     * `parameters()` order.
     */
    pub fn backward(&self, grad_output: &Array2<f32>) -> Result<(Array2<f32>, Vec<Array2<f32>>)> {
        let input = self.input.as_ref().ok_or_else(|| {
            DistillError::InvalidInput("Linear backward called before forward".to_string())
        })?;

        let mut grads = vec![input.t().dot(grad_output)];
        if self.bias.is_some() {
            grads.push(grad_output.sum_axis(Axis(0)).insert_axis(Axis(0)));
        }
        let grad_input = grad_output.dot(&self.weight.t());
        Ok((grad_input, grads))
    }

    pub fn parameters(&self) -> Vec<&Array2<f32>> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

// === DROPOUT ===

/// Inverted dropout; inactive in inference mode
#[derive(Debug, Clone)]
pub struct Dropout {
    rate: f32,
    mask: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate, mask: None }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn forward(&mut self, input: &Array2<f32>, mode: TrainingMode, rng: &mut ChaCha8Rng) -> Array2<f32> {
        if mode == TrainingMode::Inference || self.rate <= 0.0 {
            self.mask = None;
            return input.clone();
        }

        let keep = 1.0 - self.rate;
        let scale = if keep > 0.0 { 1.0 / keep } else { 0.0 };
        let mask = Array2::from_shape_fn(input.raw_dim(), |_| {
            if rng.gen::<f32>() < keep {
                scale
            } else {
                0.0
            }
        });
        let output = input * &mask;
        self.mask = Some(mask);
        output
    }

    pub fn backward(&self, grad_output: &Array2<f32>) -> Array2<f32> {
        match &self.mask {
            Some(mask) => grad_output * mask,
            None => grad_output.clone(),
        }
    }
}

// === ACTIVATIONS ===

pub fn relu(input: &Array2<f32>) -> Array2<f32> {
    input.mapv(|v| v.max(0.0))
}

/// Gradient of ReLU given the pre-activation values
pub fn relu_backward(grad_output: &Array2<f32>, pre_activation: &Array2<f32>) -> Array2<f32> {
    let mut grad = grad_output.clone();
    grad.zip_mut_with(pre_activation, |g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

pub fn leaky_relu(value: f32, negative_slope: f32) -> f32 {
    if value > 0.0 {
        value
    } else {
        negative_slope * value
    }
}

pub fn leaky_relu_derivative(value: f32, negative_slope: f32) -> f32 {
    if value > 0.0 {
        1.0
    } else {
        negative_slope
    }
}

// === OPERATOR CACHE ===

/// Propagation operator and its transpose, built once per graph
#[derive(Debug, Clone, Default)]
pub struct OperatorCache {
    cached: Option<(usize, usize, Arc<SparseMatrix>, Arc<SparseMatrix>)>,
}

impl OperatorCache {
    pub fn get<F>(&mut self, graph: &GraphData, build: F) -> (Arc<SparseMatrix>, Arc<SparseMatrix>)
    where
        F: FnOnce(&GraphData) -> SparseMatrix,
    {
        let key = (graph.num_nodes(), graph.num_edges());
        match &self.cached {
            Some((nodes, edges, op, op_t)) if (*nodes, *edges) == key => (Arc::clone(op), Arc::clone(op_t)),
            _ => {
                let op = build(graph);
                let op_t = Arc::new(op.transpose());
                let op = Arc::new(op);
                self.cached = Some((key.0, key.1, Arc::clone(&op), Arc::clone(&op_t)));
                (op, op_t)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward_backward() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut layer = Linear::new(2, 1, true, &mut rng);
        layer.weight = array![[2.0], [-1.0]];
        layer.bias = Some(array![[0.5]]);

        let input = array![[1.0f32, 3.0], [2.0, 0.0]];
        let output = layer.forward(&input).unwrap();
        assert_abs_diff_eq!(output, array![[-0.5f32], [4.5]], epsilon = 1e-6);

        let (grad_input, grads) = layer.backward(&array![[1.0f32], [1.0]]).unwrap();
        assert_abs_diff_eq!(grads[0], array![[3.0f32], [3.0]], epsilon = 1e-6);
        assert_abs_diff_eq!(grads[1], array![[2.0f32]], epsilon = 1e-6);
        assert_abs_diff_eq!(grad_input, array![[2.0f32, -1.0], [2.0, -1.0]], epsilon = 1e-6);
        assert_eq!(layer.parameters().len(), 2);
    }

    #[test]
    fn test_linear_dimension_check() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut layer = Linear::new(3, 2, false, &mut rng);
        assert!(layer.forward(&Array2::zeros((4, 2))).is_err());
        assert!(layer.backward(&Array2::zeros((4, 2))).is_err());
    }

    #[test]
    fn test_dropout_modes() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut dropout = Dropout::new(0.5);
        let input = Array2::ones((20, 20));

        let inference = dropout.forward(&input, TrainingMode::Inference, &mut rng);
        assert_eq!(inference, input);

        let training = dropout.forward(&input, TrainingMode::Training, &mut rng);
        assert!(training.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(training.iter().any(|&v| v == 0.0));

        let grad = dropout.backward(&input);
        assert_eq!(grad, training);
    }

    #[test]
    fn test_relu_backward_masks_negative_inputs() {
        let pre = array![[-1.0f32, 2.0]];
        assert_eq!(relu(&pre), array![[0.0f32, 2.0]]);
        assert_eq!(relu_backward(&array![[5.0f32, 5.0]], &pre), array![[0.0f32, 5.0]]);
        assert_abs_diff_eq!(leaky_relu(-2.0, 0.2), -0.4);
        assert_abs_diff_eq!(leaky_relu_derivative(-2.0, 0.2), 0.2);
    }

    #[test]
    fn test_xavier_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let weights = xavier_uniform((4, 2), &mut rng);
        let limit = 1.0f32;
        assert!(weights.iter().all(|w| w.abs() <= limit));
    }
}
