//! Generator: renders the source frame re-posed to match the driving frame.
//!
//! The hourglass sees the source image together with a dense motion
//! description: peak-normalised region maps of both frames, the sparse
//! foreground flow `sum_k map_k^driving * (shift_k^source - shift_k^driving)`,
//! and the background flow `A [x y 1]^T - [x y]^T`.

use animator_common::ModelParams;
use candle_core::{Result, Tensor, D};
use candle_nn::{Conv2d, Module, VarBuilder};

use crate::blocks::{coordinate_grid, same_conv, Hourglass};
use crate::norm::NormMode;
use crate::region::RegionParams;

pub struct Generator {
    hourglass: Hourglass,
    output: Conv2d,
}

impl Generator {
    pub fn new(model: &ModelParams, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        let p = &model.generator_params;
        let in_features = model.num_channels + 2 * model.num_regions + 4;
        let hourglass = Hourglass::new(
            in_features,
            p.block_expansion,
            p.num_blocks,
            p.max_features,
            mode,
            vb.pp("hourglass"),
        )?;
        let output = same_conv(hourglass.out_features(), model.num_channels, 7, vb.pp("final"))?;
        Ok(Self { hourglass, output })
    }

    /// Returns the predicted frame, `(B, C, H, W)` with values in `(0, 1)`.
    pub fn forward(
        &self,
        source: &Tensor,
        source_regions: &RegionParams,
        driving_regions: &RegionParams,
        bg_params: &Tensor,
    ) -> Result<Tensor> {
        let (_, _, h, w) = source.dims4()?;
        let maps_s = region_maps(&source_regions.heatmap, h, w)?;
        let maps_d = region_maps(&driving_regions.heatmap, h, w)?;
        let (gx, gy) = coordinate_grid(h, w, source.device())?;

        // Sparse foreground motion, weighted by where each driving region sits.
        let delta = source_regions.shift.sub(&driving_regions.shift)?;
        let (b, k, _) = delta.dims3()?;
        let dx = delta.narrow(2, 0, 1)?.reshape((b, k, 1, 1))?;
        let dy = delta.narrow(2, 1, 1)?.reshape((b, k, 1, 1))?;
        let fg_x = maps_d.broadcast_mul(&dx)?.sum_keepdim(1)?;
        let fg_y = maps_d.broadcast_mul(&dy)?.sum_keepdim(1)?;

        let (bg_x, bg_y) = background_flow(bg_params, &gx, &gy)?;

        let input = Tensor::cat(&[source, &maps_d, &maps_s, &fg_x, &fg_y, &bg_x, &bg_y], 1)?;
        let out = self.output.forward(&self.hourglass.forward(&input)?)?;
        sigmoid(&out)
    }
}

/// Heatmaps at frame resolution, scaled so each map peaks at one.
fn region_maps(heatmap: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (_, _, mh, mw) = heatmap.dims4()?;
    let maps = if (mh, mw) != (h, w) {
        heatmap.upsample_nearest2d(h, w)?
    } else {
        heatmap.clone()
    };
    let peak = maps.max_keepdim(D::Minus1)?.max_keepdim(D::Minus2)?;
    maps.broadcast_div(&peak.affine(1.0, 1e-6)?)
}

/// Displacement induced by the `(B, 2, 3)` background transforms on the
/// normalised pixel grid, as two `(B, 1, H, W)` tensors.
fn background_flow(bg_params: &Tensor, gx: &Tensor, gy: &Tensor) -> Result<(Tensor, Tensor)> {
    let b = bg_params.dim(0)?;
    let entry = |row: usize, col: usize| -> Result<Tensor> {
        bg_params.narrow(1, row, 1)?.narrow(2, col, 1)?.reshape((b, 1, 1, 1))
    };
    let flow = |row: usize, own: &Tensor| -> Result<Tensor> {
        entry(row, 0)?
            .broadcast_mul(gx)?
            .add(&entry(row, 1)?.broadcast_mul(gy)?)?
            .broadcast_add(&entry(row, 2)?)?
            .broadcast_sub(own)
    };
    Ok((flow(0, gx)?, flow(1, gy)?))
}

fn sigmoid(x: &Tensor) -> Result<Tensor> {
    x.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn identity_background_has_no_flow() {
        let (gx, gy) = coordinate_grid(4, 4, &Device::Cpu).unwrap();
        let identity = Tensor::new(&[[[1f32, 0., 0.], [0., 1., 0.]]], &Device::Cpu).unwrap();
        let (fx, fy) = background_flow(&identity, &gx, &gy).unwrap();
        let total = fx.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap()
            + fy.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(total < 1e-6);
    }

    #[test]
    fn translation_moves_every_pixel_equally() {
        let (gx, gy) = coordinate_grid(3, 3, &Device::Cpu).unwrap();
        let shift = Tensor::new(&[[[1f32, 0., 0.25], [0., 1., -0.5]]], &Device::Cpu).unwrap();
        let (fx, fy) = background_flow(&shift, &gx, &gy).unwrap();
        let fx: Vec<f32> = fx.flatten_all().unwrap().to_vec1().unwrap();
        let fy: Vec<f32> = fy.flatten_all().unwrap().to_vec1().unwrap();
        assert!(fx.iter().all(|v| (v - 0.25).abs() < 1e-6));
        assert!(fy.iter().all(|v| (v + 0.5).abs() < 1e-6));
    }
}
