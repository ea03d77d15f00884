//! Joint reconstruction step over the three trainable modules.
//!
//! One forward pass: locate regions in both frames, estimate the background
//! transform, render the source re-posed to the driving frame, and score the
//! render against the driving frame. Pure: no parameter changes, no I/O.

use animator_common::{Batch, Error, ModelParams, TrainParams};
use candle_core::{Device, Result, Tensor};
use candle_nn::VarBuilder;

use crate::background::BgPredictor;
use crate::generator::Generator;
use crate::loss::{pyramid_l1, shift_equivariance, LossBundle, LossSettings};
use crate::norm::NormMode;
use crate::region::{cat_on, RegionParams, RegionPredictor};

/// Parameter namespaces of the three modules, one per module owner.
pub struct ModuleBuilders<'a> {
    pub region_predictor: VarBuilder<'a>,
    pub bg_predictor: VarBuilder<'a>,
    pub generator: VarBuilder<'a>,
}

/// Auxiliary outputs of one reconstruction step.
#[derive(Clone)]
pub struct ReconstructionOutput {
    /// `(B, C, H, W)` reconstruction of the driving frame.
    pub prediction: Tensor,
    pub source_regions: RegionParams,
    pub driving_regions: RegionParams,
    /// `(B, 2, 3)` background transforms.
    pub bg_params: Tensor,
}

impl ReconstructionOutput {
    /// Concatenate shard outputs along the batch axis onto `device`.
    pub fn concat(parts: &[ReconstructionOutput], device: &Device) -> Result<Self> {
        let sources: Vec<_> = parts.iter().map(|p| &p.source_regions).collect();
        let drivings: Vec<_> = parts.iter().map(|p| &p.driving_regions).collect();
        Ok(Self {
            prediction: cat_on(parts.iter().map(|p| &p.prediction).collect(), device)?,
            source_regions: RegionParams::concat(&sources, device)?,
            driving_regions: RegionParams::concat(&drivings, device)?,
            bg_params: cat_on(parts.iter().map(|p| &p.bg_params).collect(), device)?,
        })
    }

    /// Copy with every tensor cut from the autograd graph.
    pub fn detach(&self) -> Self {
        let regions = |r: &RegionParams| RegionParams {
            heatmap: r.heatmap.detach(),
            shift: r.shift.detach(),
            covar: r.covar.as_ref().map(Tensor::detach),
        };
        Self {
            prediction: self.prediction.detach(),
            source_regions: regions(&self.source_regions),
            driving_regions: regions(&self.driving_regions),
            bg_params: self.bg_params.detach(),
        }
    }
}

pub struct ReconstructionModel {
    region_predictor: RegionPredictor,
    bg_predictor: BgPredictor,
    generator: Generator,
    losses: LossSettings,
    num_channels: usize,
    /// Every frame side must be a multiple of this.
    side_multiple: usize,
    /// ...and at least this long.
    min_side: usize,
}

impl ReconstructionModel {
    pub fn new(
        model: &ModelParams,
        train: &TrainParams,
        builders: ModuleBuilders,
        mode: NormMode,
    ) -> Result<Self> {
        let region_predictor = RegionPredictor::new(model, &mode, builders.region_predictor)?;
        let bg_predictor = BgPredictor::new(model, &mode, builders.bg_predictor)?;
        let generator = Generator::new(model, &mode, builders.generator)?;

        let generator_multiple = 1 << model.generator_params.num_blocks;
        let region_multiple = region_predictor.pool() << model.region_predictor_params.num_blocks;
        let side_multiple = lcm(generator_multiple, region_multiple);
        tracing::debug!(
            num_regions = model.num_regions,
            bg = ?bg_predictor.kind(),
            side_multiple,
            "reconstruction model built"
        );
        Ok(Self {
            region_predictor,
            bg_predictor,
            generator,
            losses: LossSettings::from_train_params(train),
            num_channels: model.num_channels,
            side_multiple,
            min_side: 1 << model.bg_predictor_params.num_blocks,
        })
    }

    /// Run the joint step on `batch`.
    ///
    /// The batch is checked before any computation: malformed input is a
    /// [`Error::ContractViolation`]. Loss terms are `reconstruction` and, when
    /// its weight is non-zero, `equivariance_shift`.
    pub fn forward(&self, batch: &Batch) -> animator_common::Result<(LossBundle, ReconstructionOutput)> {
        let (_, _, h, w) = self.check_batch(batch)?;

        let source_regions = self.region_predictor.forward(&batch.source)?;
        let driving_regions = self.region_predictor.forward(&batch.driving)?;
        let bg_params = self.bg_predictor.forward(&batch.source, &batch.driving)?;
        let prediction = self
            .generator
            .forward(&batch.source, &source_regions, &driving_regions, &bg_params)?;

        let mut losses = LossBundle::new();
        losses.insert(
            "reconstruction",
            pyramid_l1(&prediction, &batch.driving, &self.losses)?,
        );
        if self.losses.equivariance_weight != 0.0 {
            let [dx, dy] = self.losses.shift;
            let translated = batch.driving.roll(dy, 2)?.roll(dx, 3)?;
            let translated_regions = self.region_predictor.forward(&translated)?;
            let offset = (normalised(dx, w), normalised(dy, h));
            let term = shift_equivariance(&translated_regions.shift, &driving_regions.shift, offset)?;
            losses.insert(
                "equivariance_shift",
                term.affine(self.losses.equivariance_weight, 0.0)?,
            );
        }

        let output = ReconstructionOutput {
            prediction,
            source_regions,
            driving_regions,
            bg_params,
        };
        Ok((losses, output))
    }

    /// Check `batch` against the channel count and frame geometry this model
    /// accepts, returning `(B, C, H, W)`. Any mismatch is a
    /// [`Error::ContractViolation`].
    pub fn check_batch(&self, batch: &Batch) -> animator_common::Result<(usize, usize, usize, usize)> {
        let dims = batch.validate(self.num_channels)?;
        self.check_geometry(dims.2, dims.3)?;
        Ok(dims)
    }

    fn check_geometry(&self, h: usize, w: usize) -> animator_common::Result<()> {
        let fits = |side: usize| side % self.side_multiple == 0 && side >= self.min_side;
        if fits(h) && fits(w) {
            Ok(())
        } else {
            Err(Error::ContractViolation(format!(
                "frame size {h}x{w} must be a multiple of {} and at least {}",
                self.side_multiple, self.min_side
            )))
        }
    }
}

/// Pixel offset in `[-1, 1]` grid units along a side of `n` pixels.
fn normalised(pixels: i32, n: usize) -> f64 {
    if n > 1 {
        2.0 * pixels as f64 / (n - 1) as f64
    } else {
        0.0
    }
}

fn lcm(a: usize, b: usize) -> usize {
    fn gcd(a: usize, b: usize) -> usize {
        if b == 0 {
            a
        } else {
            gcd(b, a % b)
        }
    }
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{tiny_batch, tiny_model};

    #[test]
    fn forward_produces_per_example_losses() {
        let (_maps, model) = tiny_model(false);
        let batch = tiny_batch(3);
        let (losses, out) = model.forward(&batch).unwrap();
        assert_eq!(losses.get("reconstruction").unwrap().dims(), &[3]);
        assert!(losses.get("equivariance_shift").is_none());
        assert_eq!(out.prediction.dims(), &[3, 3, 16, 16]);
        assert_eq!(out.bg_params.dims(), &[3, 2, 3]);
        let total = losses.total().unwrap().to_scalar::<f32>().unwrap();
        assert!(total.is_finite() && total > 0.0);
    }

    #[test]
    fn equivariance_term_appears_when_weighted() {
        let (_maps, model) = tiny_model(true);
        let (losses, _) = model.forward(&tiny_batch(2)).unwrap();
        let names: Vec<_> = losses.names().collect();
        assert_eq!(names, vec!["equivariance_shift", "reconstruction"]);
    }

    #[test]
    fn wrong_channel_count_is_a_contract_violation() {
        let (_maps, model) = tiny_model(false);
        let frames = Tensor::zeros((2, 1, 16, 16), candle_core::DType::F32, &Device::Cpu).unwrap();
        let batch = Batch {
            source: frames.clone(),
            driving: frames,
        };
        assert!(matches!(model.forward(&batch), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn indivisible_frame_size_is_a_contract_violation() {
        let (_maps, model) = tiny_model(false);
        let frames = Tensor::zeros((2, 3, 10, 10), candle_core::DType::F32, &Device::Cpu).unwrap();
        let batch = Batch {
            source: frames.clone(),
            driving: frames,
        };
        assert!(matches!(model.forward(&batch), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn forward_leaves_parameters_untouched() {
        let (maps, model) = tiny_model(false);
        let snapshot = |maps: &[candle_nn::VarMap; 3]| -> Vec<f32> {
            maps.iter()
                .flat_map(|m| m.all_vars())
                .flat_map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect()
        };
        let before = snapshot(&maps);
        model.forward(&tiny_batch(2)).unwrap();
        assert_eq!(before, snapshot(&maps));
    }

    #[test]
    fn pixel_offsets_normalise_to_grid_units() {
        assert!((normalised(4, 9) - 1.0).abs() < 1e-12);
        assert_eq!(normalised(3, 1), 0.0);
        assert_eq!(lcm(4, 6), 12);
    }
}
