/**
 * @file zen-distill/src/training/distill.rs
 * @brief Training objectives: hard labels and knowledge distillation
 *
 * The distillation objective mixes the usual train-set NLL with a softened
 * KL term against a fixed teacher distribution:
 *
 * ```text
 * L = (1 − α) · NLL(train) + α · τ² · mean_v KL(p_teacher^τ(v) ‖ p_student^τ(v))
 * ```
 *
 * The KL term covers every node, labelled or not.
 */

use ndarray::{Array2, Zip};

use super::losses::{log_softmax, nll_loss_and_grad, softmax};
use crate::errors::{DistillError, Result};

/// Loss and gradient w.r.t. the logits, given labels and train nodes
pub trait Objective {
    fn loss_and_grad(&self, logits: &Array2<f32>, labels: &[usize], train: &[usize]) -> Result<(f32, Array2<f32>)>;
}

/// Plain cross-entropy on the train nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct HardLabelObjective;

impl Objective for HardLabelObjective {
    fn loss_and_grad(&self, logits: &Array2<f32>, labels: &[usize], train: &[usize]) -> Result<(f32, Array2<f32>)> {
        nll_loss_and_grad(&log_softmax(logits), labels, train)
    }
}

#[derive(Debug, Clone)]
pub struct DistillationObjective {
    /// Teacher distribution softened at `temperature`
    soft_targets: Array2<f32>,
    temperature: f32,
    alpha: f32,
}

impl DistillationObjective {
    /**
     * Build from the teacher's raw logits.
     *
     * @param teacher_logits Teacher output for every node
     * @param temperature Softening temperature τ > 0
     * @param alpha Weight of the soft term in [0, 1]
     */
    pub fn new(teacher_logits: &Array2<f32>, temperature: f32, alpha: f32) -> Result<Self> {
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(DistillError::InvalidConfiguration(format!(
                "Distillation temperature must be positive, got {}",
                temperature
            )));
        }
        if !(0.0..=1.0).contains(&alpha) {
            return Err(DistillError::InvalidConfiguration(format!(
                "Distillation alpha must be in [0, 1], got {}",
                alpha
            )));
        }
        Ok(Self {
            soft_targets: softmax(teacher_logits, temperature),
            temperature,
            alpha,
        })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn soft_targets(&self) -> &Array2<f32> {
        &self.soft_targets
    }

    /// `τ² · mean KL(teacher ‖ student)` and its gradient w.r.t. the student logits
    fn soft_loss_and_grad(&self, logits: &Array2<f32>) -> (f32, Array2<f32>) {
        let tau = self.temperature;
        let student_log_probs = log_softmax(&(logits / tau));
        let num_nodes = logits.nrows().max(1) as f32;

        let mut kl = 0.0;
        Zip::from(&self.soft_targets)
            .and(&student_log_probs)
            .for_each(|&p, &log_q| {
                if p > 0.0 {
                    kl += p * (p.ln() - log_q);
                }
            });

        // d/dz τ² KL = τ (q − p)
        let mut grad = student_log_probs.mapv(f32::exp);
        grad -= &self.soft_targets;
        grad.mapv_inplace(|g| g * tau / num_nodes);

        (tau * tau * kl / num_nodes, grad)
    }
}

impl Objective for DistillationObjective {
    fn loss_and_grad(&self, logits: &Array2<f32>, labels: &[usize], train: &[usize]) -> Result<(f32, Array2<f32>)> {
        if logits.dim() != self.soft_targets.dim() {
            return Err(DistillError::DimensionMismatch(format!(
                "Student logits {:?} do not match teacher outputs {:?}",
                logits.dim(),
                self.soft_targets.dim()
            )));
        }

        let (hard_loss, mut grad) = nll_loss_and_grad(&log_softmax(logits), labels, train)?;
        let (soft_loss, soft_grad) = self.soft_loss_and_grad(logits);

        grad.mapv_inplace(|g| g * (1.0 - self.alpha));
        grad.scaled_add(self.alpha, &soft_grad);

        Ok(((1.0 - self.alpha) * hard_loss + self.alpha * soft_loss, grad))
    }
}
