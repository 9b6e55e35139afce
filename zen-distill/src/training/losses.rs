//! Classification losses and metrics over node subsets
//!
//! All functions take full-graph score matrices and restrict the computation
//! to the rows listed in `nodes`.

use ndarray::{Array2, Axis};

use crate::errors::{DistillError, Result};

/// Row-wise `log_softmax`, stabilized by subtracting the row maximum
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut output = logits.clone();
    for mut row in output.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln() + max;
        row.mapv_inplace(|v| v - log_sum);
    }
    output
}

/// Row-wise softmax at temperature `temperature`
pub fn softmax(logits: &Array2<f32>, temperature: f32) -> Array2<f32> {
    log_softmax(&(logits / temperature)).mapv(f32::exp)
}

fn check_nodes(num_rows: usize, labels: &[usize], nodes: &[usize]) -> Result<()> {
    if labels.len() != num_rows {
        return Err(DistillError::DimensionMismatch(format!(
            "{} score rows but {} labels",
            num_rows,
            labels.len()
        )));
    }
    if let Some(&bad) = nodes.iter().find(|&&node| node >= num_rows) {
        return Err(DistillError::InvalidInput(format!(
            "Node index {} out of bounds for {} rows",
            bad, num_rows
        )));
    }
    Ok(())
}

/**
 * Mean negative log-likelihood over `nodes` and its gradient w.r.t. the logits.
 *
 * `log_probs` must be the `log_softmax` of the logits. The gradient is
 * `(softmax − onehot) / |nodes|` on the listed rows and zero elsewhere.
 * An empty node set yields zero loss and zero gradient.
 */
pub fn nll_loss_and_grad(
    log_probs: &Array2<f32>,
    labels: &[usize],
    nodes: &[usize],
) -> Result<(f32, Array2<f32>)> {
    check_nodes(log_probs.nrows(), labels, nodes)?;
    let mut grad = Array2::zeros(log_probs.raw_dim());
    if nodes.is_empty() {
        return Ok((0.0, grad));
    }

    let scale = 1.0 / nodes.len() as f32;
    let mut loss = 0.0;
    for &node in nodes {
        let label = labels[node];
        if label >= log_probs.ncols() {
            return Err(DistillError::InvalidInput(format!(
                "Label {} of node {} exceeds the {} model outputs",
                label,
                node,
                log_probs.ncols()
            )));
        }
        loss -= log_probs[[node, label]];
        let mut row = grad.row_mut(node);
        row.assign(&log_probs.row(node).mapv(f32::exp));
        row[label] -= 1.0;
        row.mapv_inplace(|g| g * scale);
    }

    Ok((loss * scale, grad))
}

/// Mean negative log-likelihood over `nodes`
pub fn nll_loss(log_probs: &Array2<f32>, labels: &[usize], nodes: &[usize]) -> Result<f32> {
    check_nodes(log_probs.nrows(), labels, nodes)?;
    if nodes.is_empty() {
        return Ok(0.0);
    }
    let total: f32 = nodes
        .iter()
        .map(|&node| -log_probs.get((node, labels[node])).copied().unwrap_or(f32::NEG_INFINITY))
        .sum();
    Ok(total / nodes.len() as f32)
}

/// Argmax class per row (lowest index on ties)
pub fn predictions(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (class, &value)| {
                    if value > best.1 {
                        (class, value)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

/// Fraction of `nodes` whose argmax prediction equals the label; 0 for an empty set
pub fn accuracy(scores: &Array2<f32>, labels: &[usize], nodes: &[usize]) -> Result<f32> {
    check_nodes(scores.nrows(), labels, nodes)?;
    if nodes.is_empty() {
        return Ok(0.0);
    }
    let preds = predictions(scores);
    let correct = nodes.iter().filter(|&&node| preds[node] == labels[node]).count();
    Ok(correct as f32 / nodes.len() as f32)
}
