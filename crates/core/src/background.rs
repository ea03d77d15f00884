//! Background motion predictor.
//!
//! Maps a `(source, driving)` pair to a `(B, 2, 3)` affine transform. The
//! regression head starts at zero, so an untrained predictor yields the
//! identity for every motion kind.

use animator_common::{BgMotion, ModelParams};
use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder};

use crate::blocks::{level_features, spatial_mean, DownBlock};
use crate::norm::NormMode;

const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
const TRANSLATION_MASK: [f32; 6] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];

pub struct BgPredictor {
    kind: BgMotion,
    encoder: Vec<DownBlock>,
    head: Linear,
}

impl BgPredictor {
    pub fn new(model: &ModelParams, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        let p = &model.bg_predictor_params;
        let mut encoder = Vec::with_capacity(p.num_blocks);
        let mut features = 2 * model.num_channels;
        for i in 0..p.num_blocks {
            let out = level_features(p.block_expansion, p.max_features, i + 1);
            encoder.push(DownBlock::new(features, out, mode, vb.pp(format!("down{i}")))?);
            features = out;
        }
        let head_vb = vb.pp("head");
        let weight = head_vb.get_with_hints((6, features), "weight", Init::Const(0.0))?;
        let bias = head_vb.get_with_hints(6, "bias", Init::Const(0.0))?;
        Ok(Self {
            kind: p.bg_type,
            encoder,
            head: Linear::new(weight, Some(bias)),
        })
    }

    pub fn kind(&self) -> BgMotion {
        self.kind
    }

    pub fn forward(&self, source: &Tensor, driving: &Tensor) -> Result<Tensor> {
        let b = source.dim(0)?;
        let device = source.device();
        let identity = Tensor::new(&IDENTITY, device)?.reshape((1, 2, 3))?.broadcast_as((b, 2, 3))?;
        if self.kind == BgMotion::Zero {
            return identity.contiguous();
        }

        let mut x = Tensor::cat(&[source, driving], 1)?;
        for block in &self.encoder {
            x = block.forward(&x)?;
        }
        let mut delta = self.head.forward(&spatial_mean(&x)?)?.reshape((b, 2, 3))?;
        if self.kind == BgMotion::Shift {
            let mask = Tensor::new(&TRANSLATION_MASK, device)?.reshape((1, 2, 3))?;
            delta = delta.broadcast_mul(&mask)?;
        }
        identity.add(&delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tiny_config;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn transform(kind: BgMotion) -> Vec<f32> {
        let mut model = tiny_config(false).model_params;
        model.bg_predictor_params.bg_type = kind;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bg = BgPredictor::new(&model, &NormMode::Local, vb).unwrap();
        let frame = Tensor::rand(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        let out = bg.forward(&frame, &frame).unwrap();
        assert_eq!(out.dims(), &[2, 2, 3]);
        out.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn untrained_predictor_is_identity_for_every_kind() {
        for kind in [BgMotion::Zero, BgMotion::Shift, BgMotion::Affine] {
            let values = transform(kind);
            assert_eq!(&values[..6], &IDENTITY, "{kind:?}");
        }
    }
}
