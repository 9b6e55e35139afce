/**
 * @file zen-distill/src/models/appnp.rs
 * @brief Approximate personalized propagation of neural predictions
 *
 * An MLP produces per-node predictions `H`, which are then smoothed with `K`
 * steps of personalized PageRank:
 *
 * ```text
 * Z_0     = H
 * Z_{t+1} = (1 - α) Â Z_t + α H
 * ```
 *
 * `Â` is the self-looped symmetric normalization used by GCN.
 */

use std::sync::Arc;

use ndarray::Array2;
use rand_chacha::ChaCha8Rng;

use super::layers::OperatorCache;
use super::mlp::MlpStack;
use super::{GraphModel, ModelKind, ModelOutput, ModelSpec, TrainingMode};
use crate::data::{GraphData, SparseMatrix};
use crate::errors::{DistillError, Result};

pub const DEFAULT_STEPS: usize = 10;

pub struct Appnp {
    mlp: MlpStack,
    steps: usize,
    alpha: f32,
    operator: OperatorCache,
    rng: ChaCha8Rng,
    operator_t: Option<Arc<SparseMatrix>>,
}

impl Appnp {
    pub fn new(spec: &ModelSpec, mut rng: ChaCha8Rng) -> Self {
        let mlp = MlpStack::new(spec, true, &mut rng);
        Self {
            mlp,
            steps: spec.k.unwrap_or(DEFAULT_STEPS),
            alpha: spec.alpha,
            operator: OperatorCache::default(),
            rng,
            operator_t: None,
        }
    }
}

impl GraphModel for Appnp {
    fn kind(&self) -> ModelKind {
        ModelKind::Appnp
    }

    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput> {
        let (op, op_t) = self.operator.get(graph, GraphData::gcn_normalized);
        let predictions = self.mlp.forward(&graph.node_features, mode, &mut self.rng)?;

        let teleport = &predictions * self.alpha;
        let mut propagated = predictions;
        for _ in 0..self.steps {
            let mut next = op.spmm(&propagated)? * (1.0 - self.alpha);
            next += &teleport;
            propagated = next;
        }

        self.operator_t = Some(op_t);
        Ok(ModelOutput::new(propagated))
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        let op_t = self.operator_t.as_ref().ok_or_else(|| {
            DistillError::InvalidInput("APPNP backward called before forward".to_string())
        })?;

        let mut grad_predictions = Array2::<f32>::zeros(grad_logits.raw_dim());
        let mut grad = grad_logits.clone();
        for _ in 0..self.steps {
            grad_predictions.scaled_add(self.alpha, &grad);
            grad = op_t.spmm(&grad)? * (1.0 - self.alpha);
        }
        grad_predictions += &grad;

        self.mlp.backward(&grad_predictions)
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        self.mlp.parameters()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.mlp.parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tests::{check_gradients, two_cluster_graph};
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn test_full_teleport_is_plain_mlp() {
        let graph = two_cluster_graph();
        let spec = ModelSpec::new(ModelKind::Appnp, 4, 2).with_hidden(4).with_alpha(1.0);
        let mut model = Appnp::new(&spec, ChaCha8Rng::seed_from_u64(0));
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let logits = model.forward(&graph, TrainingMode::Inference).unwrap().logits;
        let direct = model.mlp.forward(&graph.node_features, TrainingMode::Inference, &mut rng).unwrap();
        assert_abs_diff_eq!(logits, direct, epsilon = 1e-6);
    }

    #[test]
    fn test_appnp_gradients() {
        let spec = ModelSpec::new(ModelKind::Appnp, 4, 2).with_hidden(4).with_k(3);
        let mut model = Appnp::new(&spec, ChaCha8Rng::seed_from_u64(6));
        check_gradients(&mut model, &two_cluster_graph());
    }
}
