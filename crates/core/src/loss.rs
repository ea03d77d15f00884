//! Named per-example loss terms.

use std::collections::BTreeMap;

use animator_common::TrainParams;
use candle_core::{Device, Error, Result, Tensor};

use crate::region::cat_on;

/// Named loss terms, each a `(B,)` tensor of per-example losses.
///
/// The optimised objective is [`LossBundle::total`]: the sum over terms of
/// each term's mean over examples.
#[derive(Clone, Default)]
pub struct LossBundle {
    terms: BTreeMap<String, Tensor>,
}

impl LossBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, per_example: Tensor) {
        self.terms.insert(name.into(), per_example);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.terms.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.terms.keys().map(String::as_str)
    }

    /// Scalar objective.
    pub fn total(&self) -> Result<Tensor> {
        let mut terms = self.terms.values();
        let first = terms
            .next()
            .ok_or_else(|| Error::Msg("empty loss bundle".into()))?
            .mean_all()?;
        terms.try_fold(first, |acc, t| acc.add(&t.mean_all()?))
    }

    /// Sum of every term per example, `(B,)`. Detached.
    pub fn per_example_total(&self) -> Result<Tensor> {
        let mut terms = self.terms.values();
        let first = terms
            .next()
            .ok_or_else(|| Error::Msg("empty loss bundle".into()))?
            .detach();
        terms.try_fold(first, |acc, t| acc.add(&t.detach()))
    }

    /// Mean of each term over examples, for logging.
    pub fn means(&self) -> Result<BTreeMap<String, f32>> {
        self.terms
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.detach().mean_all()?.to_scalar::<f32>()?)))
            .collect()
    }

    /// Gather shard bundles onto `device`, concatenating each term along the
    /// batch axis in shard order. All shards must carry the same term names.
    pub fn concat(parts: &[LossBundle], device: &Device) -> Result<Self> {
        let Some(first) = parts.first() else {
            return Ok(Self::new());
        };
        let mut terms = BTreeMap::new();
        for name in first.terms.keys() {
            let shards = parts
                .iter()
                .map(|p| {
                    p.terms
                        .get(name)
                        .ok_or_else(|| Error::Msg(format!("loss term {name} missing from a shard")))
                })
                .collect::<Result<Vec<_>>>()?;
            terms.insert(name.clone(), cat_on(shards, device)?);
        }
        Ok(Self { terms })
    }
}

// ── Terms ───────────────────────────────────────────────────────────────────

/// Loss settings derived from `train_params`.
#[derive(Debug, Clone)]
pub struct LossSettings {
    pub scales: Vec<f64>,
    pub reconstruction_weights: Vec<f64>,
    pub equivariance_weight: f64,
    /// Pixel translation `(dx, dy)` for the shift equivariance term.
    pub shift: [i32; 2],
}

impl LossSettings {
    pub fn from_train_params(train: &TrainParams) -> Self {
        Self {
            scales: train.scales.clone(),
            reconstruction_weights: train.loss_weights.reconstruction.clone(),
            equivariance_weight: train.loss_weights.equivariance_shift,
            shift: train.transform_params.shift,
        }
    }
}

fn scale_pool(scale: f64) -> usize {
    ((1.0 / scale).round() as usize).max(1)
}

/// Weighted multi-scale L1 distance between `prediction` and `target`.
///
/// For each `(scale, weight)` both images are average-pooled by `1/scale` and
/// the per-example mean absolute difference is accumulated with `weight`.
/// Returns `(B,)`.
pub fn pyramid_l1(prediction: &Tensor, target: &Tensor, settings: &LossSettings) -> Result<Tensor> {
    let b = prediction.dim(0)?;
    let mut total = Tensor::zeros(b, prediction.dtype(), prediction.device())?;
    for (&scale, &weight) in settings.scales.iter().zip(&settings.reconstruction_weights) {
        if weight == 0.0 {
            continue;
        }
        let pool = scale_pool(scale);
        let (p, t) = if pool > 1 {
            (prediction.avg_pool2d(pool)?, target.avg_pool2d(pool)?)
        } else {
            (prediction.clone(), target.clone())
        };
        let l1 = p.sub(&t)?.abs()?.flatten_from(1)?.mean(1)?;
        total = total.add(&l1.affine(weight, 0.0)?)?;
    }
    Ok(total)
}

/// Mean absolute error between region shifts of a translated frame and the
/// shifts of the original frame moved by `offset` (normalised units).
/// Returns `(B,)`.
pub fn shift_equivariance(translated: &Tensor, original: &Tensor, offset: (f64, f64)) -> Result<Tensor> {
    let (_, k, _) = original.dims3()?;
    let offset = Tensor::new(&[offset.0 as f32, offset.1 as f32], original.device())?
        .reshape((1, 1, 2))?
        .broadcast_as((1, k, 2))?;
    translated
        .sub(&original.broadcast_add(&offset)?)?
        .abs()?
        .flatten_from(1)?
        .mean(1)
}
