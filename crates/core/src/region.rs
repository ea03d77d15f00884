//! Region predictor: locates `K` motion regions in a frame.
//!
//! Each region is a spatial-softmax heatmap; its first moment is the region
//! shift and, when affine estimation is enabled, its second central moment is
//! the region covariance.

use animator_common::ModelParams;
use candle_core::{Result, Tensor, D};
use candle_nn::{Conv2d, Module, VarBuilder};

use crate::blocks::{coordinate_grid, same_conv, Hourglass};
use crate::norm::NormMode;

/// Per-frame region description.
#[derive(Clone)]
pub struct RegionParams {
    /// `(B, K, h, w)`, each map sums to one. `h, w` are the predictor's
    /// working resolution, smaller than the frame when `scale_factor < 1`.
    pub heatmap: Tensor,
    /// `(B, K, 2)` region centres as `(x, y)` in `[-1, 1]`.
    pub shift: Tensor,
    /// `(B, K, 2, 2)` region covariances, present with affine estimation.
    pub covar: Option<Tensor>,
}

impl RegionParams {
    /// Concatenate shard outputs along the batch axis onto `device`.
    pub fn concat(parts: &[&RegionParams], device: &candle_core::Device) -> Result<Self> {
        let covar = match parts.iter().map(|p| p.covar.as_ref()).collect::<Option<Vec<_>>>() {
            Some(c) if !c.is_empty() => Some(cat_on(c, device)?),
            _ => None,
        };
        Ok(Self {
            heatmap: cat_on(parts.iter().map(|p| &p.heatmap).collect(), device)?,
            shift: cat_on(parts.iter().map(|p| &p.shift).collect(), device)?,
            covar,
        })
    }
}

/// Move every tensor onto `device` and concatenate along the batch axis.
pub(crate) fn cat_on(tensors: Vec<&Tensor>, device: &candle_core::Device) -> Result<Tensor> {
    let moved = tensors
        .into_iter()
        .map(|t| t.to_device(device))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&moved, 0)
}

pub struct RegionPredictor {
    pool: usize,
    predictor: Hourglass,
    regions: Conv2d,
    temperature: f64,
    estimate_affine: bool,
}

impl RegionPredictor {
    pub fn new(model: &ModelParams, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        let p = &model.region_predictor_params;
        let predictor = Hourglass::new(
            model.num_channels,
            p.block_expansion,
            p.num_blocks,
            p.max_features,
            mode,
            vb.pp("predictor"),
        )?;
        let regions = same_conv(predictor.out_features(), model.num_regions, 7, vb.pp("regions"))?;
        Ok(Self {
            pool: pool_factor(p.scale_factor),
            predictor,
            regions,
            temperature: p.temperature,
            estimate_affine: model.estimate_affine,
        })
    }

    /// Integer downsampling applied before the hourglass.
    pub fn pool(&self) -> usize {
        self.pool
    }

    pub fn forward(&self, frame: &Tensor) -> Result<RegionParams> {
        let x = if self.pool > 1 {
            frame.avg_pool2d(self.pool)?
        } else {
            frame.clone()
        };
        let logits = self.regions.forward(&self.predictor.forward(&x)?)?;
        let (b, k, h, w) = logits.dims4()?;

        let flat = logits.reshape((b, k, h * w))?.affine(1.0 / self.temperature, 0.0)?;
        let heatmap = candle_nn::ops::softmax(&flat, D::Minus1)?.reshape((b, k, h, w))?;

        let (gx, gy) = coordinate_grid(h, w, heatmap.device())?;
        let mean_x = expectation(&heatmap, &gx)?;
        let mean_y = expectation(&heatmap, &gy)?;
        let shift = Tensor::stack(&[&mean_x, &mean_y], 2)?;

        let covar = if self.estimate_affine {
            let dx = gx.broadcast_sub(&mean_x.reshape((b, k, 1, 1))?)?;
            let dy = gy.broadcast_sub(&mean_y.reshape((b, k, 1, 1))?)?;
            let cxx = expectation(&heatmap, &dx.sqr()?)?;
            let cxy = expectation(&heatmap, &dx.mul(&dy)?)?;
            let cyy = expectation(&heatmap, &dy.sqr()?)?;
            let row0 = Tensor::stack(&[&cxx, &cxy], 2)?;
            let row1 = Tensor::stack(&[&cxy, &cyy], 2)?;
            Some(Tensor::stack(&[&row0, &row1], 2)?)
        } else {
            None
        };

        Ok(RegionParams { heatmap, shift, covar })
    }
}

pub(crate) fn pool_factor(scale_factor: f64) -> usize {
    ((1.0 / scale_factor).round() as usize).max(1)
}

/// `sum_{h,w} heatmap * values`, shaped `(B, K)`.
fn expectation(heatmap: &Tensor, values: &Tensor) -> Result<Tensor> {
    heatmap.broadcast_mul(values)?.sum(D::Minus1)?.sum(D::Minus1)
}
