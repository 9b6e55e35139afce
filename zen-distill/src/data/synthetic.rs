//! Seeded stochastic-block-model graphs with class-correlated features
//!
//! Used for smoke runs and tests where no benchmark files are available.

use ndarray::Array2;
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use super::graph::GraphData;
use super::labels::LabelVector;
use crate::errors::{DistillError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticConfig {
    pub classes: usize,
    pub nodes_per_class: usize,
    pub feature_dim: usize,
    /// Edge probability between two nodes of the same class
    pub p_in: f64,
    /// Edge probability between two nodes of different classes
    pub p_out: f64,
    /// Standard deviation of the feature noise
    #[serde(default = "default_noise")]
    pub noise: f32,
    #[serde(default)]
    pub seed: u64,
}

fn default_noise() -> f32 {
    1.0
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            classes: 3,
            nodes_per_class: 20,
            feature_dim: 8,
            p_in: 0.3,
            p_out: 0.02,
            noise: default_noise(),
            seed: 0,
        }
    }
}

impl SyntheticConfig {
    fn validate(&self) -> Result<()> {
        if self.classes == 0 || self.nodes_per_class == 0 || self.feature_dim == 0 {
            return Err(DistillError::InvalidConfiguration(
                "Synthetic graph needs at least one class, node and feature".to_string(),
            ));
        }
        for (name, p) in [("p_in", self.p_in), ("p_out", self.p_out)] {
            if !(0.0..=1.0).contains(&p) {
                return Err(DistillError::InvalidConfiguration(format!(
                    "{} must be a probability, got {}",
                    name, p
                )));
            }
        }
        Ok(())
    }
}

/**
 * Generate an undirected SBM graph.
 *
 * Node `i` belongs to class `i / nodes_per_class`. Features are Gaussian noise
 * plus a unit offset on feature `class % feature_dim`, so classes are
 * separable by features alone when the noise is small.
 */
pub fn generate(config: &SyntheticConfig) -> Result<(GraphData, LabelVector)> {
    config.validate()?;

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let num_nodes = config.classes * config.nodes_per_class;
    let labels: Vec<usize> = (0..num_nodes).map(|node| node / config.nodes_per_class).collect();

    let noise = Normal::new(0.0f32, config.noise)
        .map_err(|e| DistillError::InvalidConfiguration(format!("Invalid noise level: {}", e)))?;
    let mut features = Array2::random_using((num_nodes, config.feature_dim), noise, &mut rng);
    for (node, &class) in labels.iter().enumerate() {
        features[[node, class % config.feature_dim]] += 1.0;
    }

    let mut edges = Vec::new();
    for source in 0..num_nodes {
        for target in (source + 1)..num_nodes {
            let p = if labels[source] == labels[target] {
                config.p_in
            } else {
                config.p_out
            };
            if rng.gen_bool(p) {
                edges.push((source, target));
                edges.push((target, source));
            }
        }
    }

    Ok((GraphData::new(features, edges)?, LabelVector::new(labels)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_is_seeded() {
        let config = SyntheticConfig {
            seed: 11,
            ..SyntheticConfig::default()
        };
        let (graph_a, labels_a) = generate(&config).unwrap();
        let (graph_b, labels_b) = generate(&config).unwrap();

        assert_eq!(graph_a.num_nodes(), 60);
        assert_eq!(labels_a.num_classes(), 3);
        assert_eq!(labels_a, labels_b);
        assert_eq!(graph_a.edges(), graph_b.edges());
        assert_eq!(graph_a.node_features, graph_b.node_features);
        assert!(graph_a.adjacency_list.is_undirected());
    }

    #[test]
    fn test_invalid_probability() {
        let config = SyntheticConfig {
            p_in: 1.5,
            ..SyntheticConfig::default()
        };
        assert!(generate(&config).is_err());
    }
}
