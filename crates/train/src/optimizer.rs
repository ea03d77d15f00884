//! Adam over the joint parameter set.
//!
//! Per-parameter step counts and bias-corrected moments. A parameter without
//! a gradient in a step is left alone: neither its value nor its moments
//! change.

use std::collections::BTreeMap;

use animator_common::{Result, TrainParams};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::modules::ParameterSet;

#[derive(Debug, Clone, Copy)]
pub struct AdamParams {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamParams {
    pub fn from_train_params(train: &TrainParams) -> Self {
        Self {
            beta1: train.betas[0],
            beta2: train.betas[1],
            eps: 1e-8,
        }
    }
}

/// Moment estimates of one parameter.
pub struct MomentState {
    pub exp_avg: Var,
    pub exp_avg_sq: Var,
    /// Updates applied to this parameter so far.
    pub step: usize,
}

/// Optimizer state: exactly one [`MomentState`] per parameter of the set it
/// was built from, keyed by parameter name. Never grows.
pub struct Adam {
    params: AdamParams,
    state: BTreeMap<String, MomentState>,
    steps: usize,
}

impl Adam {
    pub fn new(parameters: &ParameterSet, params: AdamParams) -> Result<Self> {
        let mut state = BTreeMap::new();
        for p in parameters.iter() {
            let t = p.var.as_tensor();
            state.insert(
                p.name.clone(),
                MomentState {
                    exp_avg: Var::zeros(t.shape(), t.dtype(), t.device())?,
                    exp_avg_sq: Var::zeros(t.shape(), t.dtype(), t.device())?,
                    step: 0,
                },
            );
        }
        Ok(Self {
            params,
            state,
            steps: 0,
        })
    }

    pub fn params(&self) -> AdamParams {
        self.params
    }

    /// Optimizer steps taken since construction or restore.
    pub fn step_count(&self) -> usize {
        self.steps
    }

    pub fn moments(&self) -> &BTreeMap<String, MomentState> {
        &self.state
    }

    pub(crate) fn moments_mut(&mut self) -> &mut BTreeMap<String, MomentState> {
        &mut self.state
    }

    /// Recompute the step counter after the moments were overwritten.
    pub(crate) fn sync_step_count(&mut self) {
        self.steps = self.state.values().map(|m| m.step).max().unwrap_or(0);
    }

    /// Apply one update with learning rate `lr`. Returns the number of
    /// parameters that had a gradient.
    pub fn step(&mut self, parameters: &ParameterSet, grads: &GradStore, lr: f64) -> Result<usize> {
        let AdamParams { beta1, beta2, eps } = self.params;
        let mut updated = 0;
        for p in parameters.iter() {
            let Some(grad) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let Some(m) = self.state.get_mut(&p.name) else {
                continue;
            };
            m.step += 1;
            let t = m.step as i32;

            let exp_avg = m
                .exp_avg
                .as_tensor()
                .affine(beta1, 0.0)?
                .add(&grad.affine(1.0 - beta1, 0.0)?)?;
            let exp_avg_sq = m
                .exp_avg_sq
                .as_tensor()
                .affine(beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let bias_correction1 = 1.0 - beta1.powi(t);
            let bias_correction2 = 1.0 - beta2.powi(t);
            let denom = exp_avg_sq
                .sqrt()?
                .affine(1.0 / bias_correction2.sqrt(), eps)?;
            let update: Tensor = exp_avg.div(&denom)?.affine(lr / bias_correction1, 0.0)?;

            p.var.set(&p.var.as_tensor().sub(&update)?)?;
            m.exp_avg.set(&exp_avg)?;
            m.exp_avg_sq.set(&exp_avg_sq)?;
            updated += 1;
        }
        self.steps += 1;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleSet;
    use crate::tests::{tiny_batch, tiny_config};
    use candle_core::Device;

    fn setup() -> (ModuleSet, ParameterSet, Adam) {
        let config = tiny_config();
        let modules = ModuleSet::new(&config, &Device::Cpu).unwrap();
        let params = ParameterSet::collect(&modules).unwrap();
        let adam = Adam::new(&params, AdamParams::from_train_params(&config.train_params)).unwrap();
        (modules, params, adam)
    }

    #[test]
    fn one_entry_per_parameter() {
        let (_modules, params, adam) = setup();
        assert_eq!(adam.moments().len(), params.len());
        assert!(params.iter().all(|p| adam.moments().contains_key(&p.name)));
    }

    #[test]
    fn first_step_moves_each_weight_by_at_most_lr() {
        let (modules, params, mut adam) = setup();
        let before: Vec<Tensor> = params.iter().map(|p| p.var.as_tensor().copy().unwrap()).collect();
        let (losses, _) = modules.model().forward(&tiny_batch(2)).unwrap();
        let grads = losses.total().unwrap().backward().unwrap();
        let lr = 1e-2;
        let updated = adam.step(&params, &grads, lr).unwrap();
        assert!(updated > 0);
        assert_eq!(adam.step_count(), 1);
        for (p, old) in params.iter().zip(&before) {
            let delta = p.var.as_tensor().sub(old).unwrap().abs().unwrap()
                .flatten_all().unwrap().max(0).unwrap().to_scalar::<f32>().unwrap();
            assert!(delta <= (lr * 1.0001) as f32, "{} moved by {delta}", p.name);
        }
    }

    #[test]
    fn parameters_without_gradient_are_skipped() {
        let (_modules, params, mut adam) = setup();
        let unrelated = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap().sum_all().unwrap();
        let grads = unrelated.backward().unwrap();
        assert_eq!(adam.step(&params, &grads, 1e-3).unwrap(), 0);
        assert!(adam.moments().values().all(|m| m.step == 0));
    }
}
