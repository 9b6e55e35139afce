//! Owned snapshots of model parameters and optimizer state

use std::fs;
use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::optimizers::{Optimizer, OptimizerState};
use crate::errors::{DistillError, Result};
use crate::models::GraphModel;

/**
 * By-value copy of every trainable parameter plus the optimizer state.
 *
 * A checkpoint never aliases the live model or optimizer: later updates do
 * not affect it, and restoring it copies the values back.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub parameters: Vec<Array2<f32>>,
    pub optimizer: OptimizerState,
}

impl Checkpoint {
    pub fn capture(model: &dyn GraphModel, optimizer: &dyn Optimizer, epoch: usize) -> Self {
        Self {
            epoch,
            parameters: model.parameters().into_iter().cloned().collect(),
            optimizer: optimizer.state(),
        }
    }

    /// Copy the snapshot back into `model` and `optimizer`
    pub fn restore(&self, model: &mut dyn GraphModel, optimizer: &mut dyn Optimizer) -> Result<()> {
        let mut live = model.parameters_mut();
        if live.len() != self.parameters.len() {
            return Err(DistillError::DimensionMismatch(format!(
                "Checkpoint holds {} parameters but the model has {}",
                self.parameters.len(),
                live.len()
            )));
        }
        for (i, (target, saved)) in live.iter_mut().zip(&self.parameters).enumerate() {
            if target.dim() != saved.dim() {
                return Err(DistillError::DimensionMismatch(format!(
                    "Checkpoint parameter {} has shape {:?}, model expects {:?}",
                    i,
                    saved.dim(),
                    target.dim()
                )));
            }
            target.assign(saved);
        }
        optimizer.load_state(self.optimizer.clone())
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{build_model, ModelKind, ModelSpec};
    use crate::training::optimizers::Adam;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_is_independent_of_live_model() {
        let spec = ModelSpec::new(ModelKind::Mlp, 3, 2).with_hidden(4);
        let mut model = build_model(&spec, 0).unwrap();
        let mut optimizer = Adam::new(0.1);

        let checkpoint = Checkpoint::capture(model.as_ref(), &optimizer, 4);
        let original = checkpoint.parameters[0].clone();

        let grads: Vec<_> = model.parameters().iter().map(|p| Array2::ones(p.raw_dim())).collect();
        optimizer.step(model.parameters_mut(), &grads).unwrap();
        assert_ne!(model.parameters()[0], &original);
        assert_eq!(checkpoint.parameters[0], original);

        checkpoint.restore(model.as_mut(), &mut optimizer).unwrap();
        assert_eq!(model.parameters()[0], &original);
        assert_eq!(optimizer.state().step, 0);
    }

    #[test]
    fn test_restore_rejects_other_architectures() {
        let small = build_model(&ModelSpec::new(ModelKind::Mlp, 3, 2).with_hidden(4), 0).unwrap();
        let mut large = build_model(&ModelSpec::new(ModelKind::Mlp, 3, 2).with_hidden(5), 0).unwrap();
        let mut optimizer = Adam::new(0.1);

        let checkpoint = Checkpoint::capture(small.as_ref(), &optimizer, 1);
        assert!(checkpoint.restore(large.as_mut(), &mut optimizer).is_err());
    }

    #[test]
    fn test_json_persistence() {
        let model = build_model(&ModelSpec::new(ModelKind::Sgc, 3, 2), 1).unwrap();
        let optimizer = Adam::new(0.01);
        let checkpoint = Checkpoint::capture(model.as_ref(), &optimizer, 7);

        let dir = tempdir().unwrap();
        let path = dir.path().join("best.json");
        checkpoint.save_json(&path).unwrap();
        assert_eq!(Checkpoint::load_json(&path).unwrap(), checkpoint);
    }
}
