/**
 * @file zen-distill/src/models/gat.rs
 * @brief Graph attention network (Veličković et al.)
 *
 * Every layer projects node features per head, scores each edge `s → d` as
 * `LeakyReLU(a_srcᵀ Wh_s + a_dstᵀ Wh_d)`, normalizes the scores with a softmax
 * over the incoming edges of `d`, and aggregates `Σ α_sd Wh_s`.
 *
 * Hidden layers concatenate their heads and apply ReLU; the output layer has a
 * single head and no activation. Self-loops are always added so every node
 * attends at least to itself. The last layer's attention coefficients are
 * returned alongside the logits, aligned with
 * [`GraphData::edges_with_self_loops`].
 */

use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};
use rand_chacha::ChaCha8Rng;

use super::layers::{
    leaky_relu, leaky_relu_derivative, relu, relu_backward, xavier_uniform, Dropout,
};
use super::{GraphModel, ModelKind, ModelOutput, ModelSpec, TrainingMode};
use crate::data::GraphData;
use crate::errors::{DistillError, Result};

/// Negative slope of the attention LeakyReLU
const NEGATIVE_SLOPE: f32 = 0.2;

/// Self-looped edge list with incoming edges grouped by destination
#[derive(Debug)]
struct EdgeIndex {
    edges: Vec<(usize, usize)>,
    by_dst: Vec<Vec<usize>>,
}

impl EdgeIndex {
    fn new(graph: &GraphData) -> Self {
        let edges = graph.edges_with_self_loops();
        let mut by_dst = vec![Vec::new(); graph.num_nodes()];
        for (edge_id, &(_, dst)) in edges.iter().enumerate() {
            by_dst[dst].push(edge_id);
        }
        Self { edges, by_dst }
    }
}

// === ATTENTION LAYER ===

struct GatLayer {
    num_heads: usize,
    out_dim: usize,
    fc: Array2<f32>,
    attn_src: Array2<f32>,
    attn_dst: Array2<f32>,
    bias: Array2<f32>,
    feat_drop: Dropout,
    attn_drop: Dropout,

    // Forward cache
    input: Option<Array2<f32>>,
    projected: Array2<f32>,
    scores: Array2<f32>,
    alpha: Array2<f32>,
    alpha_dropped: Array2<f32>,
}

impl GatLayer {
    fn new(
        in_dim: usize,
        out_dim: usize,
        num_heads: usize,
        feat_drop: f32,
        attn_drop: f32,
        rng: &mut ChaCha8Rng,
    ) -> Self {
        Self {
            num_heads,
            out_dim,
            fc: xavier_uniform((in_dim, num_heads * out_dim), rng),
            attn_src: xavier_uniform((num_heads, out_dim), rng),
            attn_dst: xavier_uniform((num_heads, out_dim), rng),
            bias: Array2::zeros((1, num_heads * out_dim)),
            feat_drop: Dropout::new(feat_drop),
            attn_drop: Dropout::new(attn_drop),
            input: None,
            projected: Array2::zeros((0, 0)),
            scores: Array2::zeros((0, 0)),
            alpha: Array2::zeros((0, 0)),
            alpha_dropped: Array2::zeros((0, 0)),
        }
    }

    /// Per-node, per-head dot product with an attention vector: [N, heads]
    fn head_scores(&self, projected: &Array2<f32>, attn: &Array2<f32>) -> Array2<f32> {
        let (num_nodes, f) = (projected.nrows(), self.out_dim);
        Array2::from_shape_fn((num_nodes, self.num_heads), |(i, k)| {
            (0..f).map(|j| projected[[i, k * f + j]] * attn[[k, j]]).sum()
        })
    }

    fn forward(
        &mut self,
        input: &Array2<f32>,
        edges: &EdgeIndex,
        mode: TrainingMode,
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<f32>> {
        if input.ncols() != self.fc.nrows() {
            return Err(DistillError::DimensionMismatch(format!(
                "GAT layer expects {} input features, got {}",
                self.fc.nrows(),
                input.ncols()
            )));
        }
        let (heads, f) = (self.num_heads, self.out_dim);
        let num_edges = edges.edges.len();

        let dropped = self.feat_drop.forward(input, mode, rng);
        let projected = dropped.dot(&self.fc);
        let el = self.head_scores(&projected, &self.attn_src);
        let er = self.head_scores(&projected, &self.attn_dst);

        let scores = Array2::from_shape_fn((num_edges, heads), |(e, k)| {
            let (src, dst) = edges.edges[e];
            el[[src, k]] + er[[dst, k]]
        });

        // Edge softmax per destination and head
        let mut alpha = Array2::zeros((num_edges, heads));
        for group in &edges.by_dst {
            for k in 0..heads {
                let max = group
                    .iter()
                    .map(|&e| leaky_relu(scores[[e, k]], NEGATIVE_SLOPE))
                    .fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0;
                for &e in group {
                    let weight = (leaky_relu(scores[[e, k]], NEGATIVE_SLOPE) - max).exp();
                    alpha[[e, k]] = weight;
                    total += weight;
                }
                for &e in group {
                    alpha[[e, k]] /= total;
                }
            }
        }

        let alpha_dropped = self.attn_drop.forward(&alpha, mode, rng);

        let mut output = Array2::zeros((input.nrows(), heads * f));
        for (e, &(src, dst)) in edges.edges.iter().enumerate() {
            for k in 0..heads {
                let weight = alpha_dropped[[e, k]];
                if weight == 0.0 {
                    continue;
                }
                for j in 0..f {
                    output[[dst, k * f + j]] += weight * projected[[src, k * f + j]];
                }
            }
        }
        output += &self.bias;

        self.input = Some(dropped);
        self.projected = projected;
        self.scores = scores;
        self.alpha = alpha;
        self.alpha_dropped = alpha_dropped;
        Ok(output)
    }

    /// Returns the input gradient and `[fc, attn_src, attn_dst, bias]` gradients
    fn backward(&self, grad_output: &Array2<f32>, edges: &EdgeIndex) -> Result<(Array2<f32>, Vec<Array2<f32>>)> {
        let input = self.input.as_ref().ok_or_else(|| {
            DistillError::InvalidInput("GAT backward called before forward".to_string())
        })?;
        let (heads, f) = (self.num_heads, self.out_dim);
        let num_edges = edges.edges.len();
        let projected = &self.projected;

        let grad_bias = grad_output.sum_axis(Axis(0)).insert_axis(Axis(0));

        // Aggregation: out_d = Σ α_e Wh_s
        let mut grad_projected = Array2::<f32>::zeros(projected.raw_dim());
        let mut grad_alpha_dropped = Array2::<f32>::zeros((num_edges, heads));
        for (e, &(src, dst)) in edges.edges.iter().enumerate() {
            for k in 0..heads {
                let weight = self.alpha_dropped[[e, k]];
                let mut dot = 0.0;
                for j in 0..f {
                    let g = grad_output[[dst, k * f + j]];
                    dot += g * projected[[src, k * f + j]];
                    grad_projected[[src, k * f + j]] += weight * g;
                }
                grad_alpha_dropped[[e, k]] = dot;
            }
        }
        let grad_alpha = self.attn_drop.backward(&grad_alpha_dropped);

        // Softmax and LeakyReLU
        let mut grad_el = Array2::<f32>::zeros((projected.nrows(), heads));
        let mut grad_er = Array2::<f32>::zeros((projected.nrows(), heads));
        for (dst, group) in edges.by_dst.iter().enumerate() {
            for k in 0..heads {
                let weighted: f32 = group
                    .iter()
                    .map(|&e| self.alpha[[e, k]] * grad_alpha[[e, k]])
                    .sum();
                for &e in group {
                    let grad_logit = self.alpha[[e, k]] * (grad_alpha[[e, k]] - weighted);
                    let grad_score = grad_logit * leaky_relu_derivative(self.scores[[e, k]], NEGATIVE_SLOPE);
                    let (src, _) = edges.edges[e];
                    grad_el[[src, k]] += grad_score;
                    grad_er[[dst, k]] += grad_score;
                }
            }
        }

        // el = Σ_j Wh[:, k, j] a_src[k, j], likewise er
        let mut grad_attn_src = Array2::<f32>::zeros(self.attn_src.raw_dim());
        let mut grad_attn_dst = Array2::<f32>::zeros(self.attn_dst.raw_dim());
        for i in 0..projected.nrows() {
            for k in 0..heads {
                let (gl, gr) = (grad_el[[i, k]], grad_er[[i, k]]);
                if gl == 0.0 && gr == 0.0 {
                    continue;
                }
                for j in 0..f {
                    let value = projected[[i, k * f + j]];
                    grad_attn_src[[k, j]] += gl * value;
                    grad_attn_dst[[k, j]] += gr * value;
                    grad_projected[[i, k * f + j]] += gl * self.attn_src[[k, j]] + gr * self.attn_dst[[k, j]];
                }
            }
        }

        let grad_fc = input.t().dot(&grad_projected);
        let grad_input = self.feat_drop.backward(&grad_projected.dot(&self.fc.t()));

        Ok((grad_input, vec![grad_fc, grad_attn_src, grad_attn_dst, grad_bias]))
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        vec![&self.fc, &self.attn_src, &self.attn_dst, &self.bias]
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        vec![&mut self.fc, &mut self.attn_src, &mut self.attn_dst, &mut self.bias]
    }
}

// === MODEL ===

pub struct Gat {
    layers: Vec<GatLayer>,
    rng: ChaCha8Rng,
    edge_cache: Option<(usize, usize, Arc<EdgeIndex>)>,
    pre_activations: Vec<Array2<f32>>,
}

impl Gat {
    pub fn new(spec: &ModelSpec, mut rng: ChaCha8Rng) -> Self {
        let mut layers = Vec::with_capacity(spec.num_layers + 1);
        let mut in_dim = spec.in_dim;
        for _ in 0..spec.num_layers {
            layers.push(GatLayer::new(
                in_dim,
                spec.hidden,
                spec.num_heads,
                spec.dropout,
                spec.attn_drop,
                &mut rng,
            ));
            in_dim = spec.hidden * spec.num_heads;
        }
        layers.push(GatLayer::new(
            in_dim,
            spec.num_classes,
            1,
            spec.dropout,
            spec.attn_drop,
            &mut rng,
        ));

        Self {
            layers,
            rng,
            edge_cache: None,
            pre_activations: Vec::new(),
        }
    }

    fn edge_index(&mut self, graph: &GraphData) -> Arc<EdgeIndex> {
        let key = (graph.num_nodes(), graph.num_edges());
        match &self.edge_cache {
            Some((nodes, edges, index)) if (*nodes, *edges) == key => Arc::clone(index),
            _ => {
                let index = Arc::new(EdgeIndex::new(graph));
                self.edge_cache = Some((key.0, key.1, Arc::clone(&index)));
                index
            }
        }
    }

    fn cached_edges(&self) -> Result<Arc<EdgeIndex>> {
        self.edge_cache
            .as_ref()
            .map(|(_, _, index)| Arc::clone(index))
            .ok_or_else(|| DistillError::InvalidInput("GAT backward called before forward".to_string()))
    }
}

impl GraphModel for Gat {
    fn kind(&self) -> ModelKind {
        ModelKind::Gat
    }

    fn forward(&mut self, graph: &GraphData, mode: TrainingMode) -> Result<ModelOutput> {
        let edges = self.edge_index(graph);
        let last = self.layers.len() - 1;

        self.pre_activations.clear();
        let mut hidden = graph.node_features.clone();
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let z = layer.forward(&hidden, &edges, mode, &mut self.rng)?;
            hidden = if i < last { relu(&z) } else { z.clone() };
            self.pre_activations.push(z);
        }

        let attention: Array1<f32> = self.layers[last].alpha.column(0).to_owned();
        Ok(ModelOutput {
            logits: hidden,
            attention: Some(attention),
        })
    }

    fn backward(&mut self, grad_logits: &Array2<f32>) -> Result<Vec<Array2<f32>>> {
        let edges = self.cached_edges()?;
        let last = self.layers.len() - 1;

        let mut grads_per_layer = Vec::with_capacity(self.layers.len());
        let mut grad = grad_logits.clone();
        for i in (0..self.layers.len()).rev() {
            if i < last {
                grad = relu_backward(&grad, &self.pre_activations[i]);
            }
            let (grad_input, grads) = self.layers[i].backward(&grad, &edges)?;
            grads_per_layer.push(grads);
            grad = grad_input;
        }

        Ok(grads_per_layer.into_iter().rev().flatten().collect())
    }

    fn parameters(&self) -> Vec<&Array2<f32>> {
        self.layers.iter().flat_map(GatLayer::parameters).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Array2<f32>> {
        self.layers.iter_mut().flat_map(GatLayer::parameters_mut).collect()
    }
}
