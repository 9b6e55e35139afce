//! Gradient-descent optimizers with capturable state
//!
//! Both optimizers update parameter matrices in place and expose their full
//! internal state (step count, learning rate, moment buffers) as an
//! [`OptimizerState`] value, so the training loop can snapshot and restore an
//! optimizer alongside the model weights.

use std::collections::BTreeMap;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::errors::{DistillError, Result};

/// Serializable optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: u64,
    pub learning_rate: f32,
    /// Named per-parameter buffers, e.g. Adam's `exp_avg` / `exp_avg_sq`
    pub buffers: BTreeMap<String, Vec<Array2<f32>>>,
}

pub trait Optimizer: Send {
    /// Apply one update; `grads[i]` belongs to `params[i]`
    fn step(&mut self, params: Vec<&mut Array2<f32>>, grads: &[Array2<f32>]) -> Result<()>;

    fn state(&self) -> OptimizerState;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;

    fn learning_rate(&self) -> f32;
}

fn check_shapes(params: &[&mut Array2<f32>], grads: &[Array2<f32>]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(DistillError::DimensionMismatch(format!(
            "{} parameters but {} gradients",
            params.len(),
            grads.len()
        )));
    }
    for (i, (param, grad)) in params.iter().zip(grads).enumerate() {
        if param.dim() != grad.dim() {
            return Err(DistillError::DimensionMismatch(format!(
                "Parameter {} has shape {:?} but its gradient has shape {:?}",
                i,
                param.dim(),
                grad.dim()
            )));
        }
    }
    Ok(())
}

fn check_finite(param: &Array2<f32>, optimizer: &str) -> Result<()> {
    if param.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(DistillError::NumericalInstability(format!(
            "Parameter became NaN or infinite during {} update",
            optimizer
        )))
    }
}

fn zeros_like(params: &[&mut Array2<f32>]) -> Vec<Array2<f32>> {
    params.iter().map(|p| Array2::zeros(p.raw_dim())).collect()
}

fn take_buffer(state: &mut OptimizerState, name: &str) -> Vec<Array2<f32>> {
    state.buffers.remove(name).unwrap_or_default()
}

// === ADAM ===

/// Adam with bias correction and coupled L2 weight decay
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,

    step_count: u64,
    exp_avg: Vec<Array2<f32>>,
    exp_avg_sq: Vec<Array2<f32>>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            step_count: 0,
            exp_avg: Vec::new(),
            exp_avg_sq: Vec::new(),
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, mut params: Vec<&mut Array2<f32>>, grads: &[Array2<f32>]) -> Result<()> {
        check_shapes(&params, grads)?;
        if self.exp_avg.len() != params.len() {
            self.exp_avg = zeros_like(&params);
            self.exp_avg_sq = zeros_like(&params);
        }

        self.step_count += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step_count as i32);
        let step_size = self.learning_rate / bias_correction1;
        let (beta1, beta2, epsilon, weight_decay) = (self.beta1, self.beta2, self.epsilon, self.weight_decay);

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            // L2 regularization folded into the gradient
            let mut d_p = grad.clone();
            if weight_decay != 0.0 {
                d_p.scaled_add(weight_decay, &**param);
            }

            let m = &mut self.exp_avg[i];
            let v = &mut self.exp_avg_sq[i];
            m.zip_mut_with(&d_p, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
            v.zip_mut_with(&d_p, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

            ndarray::Zip::from(&mut **param)
                .and(&*m)
                .and(&*v)
                .for_each(|p, &m, &v| {
                    let denom = (v / bias_correction2).sqrt() + epsilon;
                    *p -= step_size * m / denom;
                });

            check_finite(param, "Adam")?;
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut buffers = BTreeMap::new();
        buffers.insert("exp_avg".to_string(), self.exp_avg.clone());
        buffers.insert("exp_avg_sq".to_string(), self.exp_avg_sq.clone());
        OptimizerState {
            step: self.step_count,
            learning_rate: self.learning_rate,
            buffers,
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        let exp_avg = take_buffer(&mut state, "exp_avg");
        let exp_avg_sq = take_buffer(&mut state, "exp_avg_sq");
        if exp_avg.len() != exp_avg_sq.len() {
            return Err(DistillError::InvalidInput(
                "Adam state has mismatched moment buffers".to_string(),
            ));
        }
        self.step_count = state.step;
        self.learning_rate = state.learning_rate;
        self.exp_avg = exp_avg;
        self.exp_avg_sq = exp_avg_sq;
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

// === SGD ===

/// Stochastic gradient descent with optional momentum and weight decay
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: f32,

    step_count: u64,
    momentum_buffers: Vec<Array2<f32>>,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            step_count: 0,
            momentum_buffers: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, mut params: Vec<&mut Array2<f32>>, grads: &[Array2<f32>]) -> Result<()> {
        check_shapes(&params, grads)?;
        if self.momentum != 0.0 && self.momentum_buffers.len() != params.len() {
            self.momentum_buffers = Vec::new();
        }
        self.step_count += 1;
        let momentum = self.momentum;

        for (i, (param, grad)) in params.iter_mut().zip(grads).enumerate() {
            let mut d_p = grad.clone();
            if self.weight_decay != 0.0 {
                d_p.scaled_add(self.weight_decay, &**param);
            }

            if momentum != 0.0 {
                if let Some(buffer) = self.momentum_buffers.get_mut(i) {
                    buffer.mapv_inplace(|b| b * momentum);
                    *buffer += &d_p;
                    d_p.assign(buffer);
                } else {
                    self.momentum_buffers.push(d_p.clone());
                }
            }

            param.scaled_add(-self.learning_rate, &d_p);
            check_finite(param, "SGD")?;
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut buffers = BTreeMap::new();
        if self.momentum != 0.0 {
            buffers.insert("momentum_buffer".to_string(), self.momentum_buffers.clone());
        }
        OptimizerState {
            step: self.step_count,
            learning_rate: self.learning_rate,
            buffers,
        }
    }

    fn load_state(&mut self, mut state: OptimizerState) -> Result<()> {
        self.step_count = state.step;
        self.learning_rate = state.learning_rate;
        self.momentum_buffers = take_buffer(&mut state, "momentum_buffer");
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

// === CONFIGURATION ===

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam { learning_rate: f32, weight_decay: f32 },
    Sgd { learning_rate: f32, momentum: f32, weight_decay: f32 },
}

impl OptimizerConfig {
    pub fn build(&self) -> Result<Box<dyn Optimizer>> {
        let optimizer: Box<dyn Optimizer> = match *self {
            OptimizerConfig::Adam {
                learning_rate,
                weight_decay,
            } => {
                validate_rates(learning_rate, weight_decay)?;
                Box::new(Adam::new(learning_rate).with_weight_decay(weight_decay))
            }
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
                weight_decay,
            } => {
                validate_rates(learning_rate, weight_decay)?;
                Box::new(
                    Sgd::new(learning_rate)
                        .with_momentum(momentum)
                        .with_weight_decay(weight_decay),
                )
            }
        };
        Ok(optimizer)
    }
}

fn validate_rates(learning_rate: f32, weight_decay: f32) -> Result<()> {
    if !(learning_rate > 0.0 && learning_rate.is_finite()) {
        return Err(DistillError::InvalidConfiguration(format!(
            "Learning rate must be positive, got {}",
            learning_rate
        )));
    }
    if weight_decay < 0.0 {
        return Err(DistillError::InvalidConfiguration(format!(
            "Weight decay must be non-negative, got {}",
            weight_decay
        )));
    }
    Ok(())
}
