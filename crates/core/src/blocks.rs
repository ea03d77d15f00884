//! Convolutional building blocks shared by the three trainable modules.

use candle_core::{Result, Tensor, D};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::norm::{BatchNorm2d, NormMode};

fn padded(padding: usize) -> Conv2dConfig {
    Conv2dConfig {
        padding,
        ..Default::default()
    }
}

/// 3x3 convolution, batch norm, ReLU.
pub struct ConvBlock {
    conv: Conv2d,
    norm: BatchNorm2d,
}

impl ConvBlock {
    pub fn new(in_features: usize, out_features: usize, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        let conv = conv2d(in_features, out_features, 3, padded(1), vb.pp("conv"))?;
        let norm = BatchNorm2d::new(out_features, mode.clone(), vb.pp("norm"))?;
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.norm.forward(&self.conv.forward(x)?)?.relu()
    }
}

/// [`ConvBlock`] followed by 2x2 average pooling.
pub struct DownBlock(ConvBlock);

impl DownBlock {
    pub fn new(in_features: usize, out_features: usize, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        Ok(Self(ConvBlock::new(in_features, out_features, mode, vb)?))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.0.forward(x)?.avg_pool2d(2)
    }
}

/// Nearest-neighbour 2x upsampling followed by a [`ConvBlock`].
pub struct UpBlock(ConvBlock);

impl UpBlock {
    pub fn new(in_features: usize, out_features: usize, mode: &NormMode, vb: VarBuilder) -> Result<Self> {
        Ok(Self(ConvBlock::new(in_features, out_features, mode, vb)?))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = x.dims4()?;
        self.0.forward(&x.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Feature width after `level` halvings of the input resolution.
pub(crate) fn level_features(block_expansion: usize, max_features: usize, level: usize) -> usize {
    (block_expansion << level).min(max_features)
}

/// Encoder/decoder with skip connections.
///
/// The input's height and width must be divisible by `2^num_blocks`. The
/// output keeps the input resolution and has [`Hourglass::out_features`]
/// channels: the last decoder block concatenated with the input itself.
pub struct Hourglass {
    down: Vec<DownBlock>,
    up: Vec<UpBlock>,
    out_features: usize,
}

impl Hourglass {
    pub fn new(
        in_features: usize,
        block_expansion: usize,
        num_blocks: usize,
        max_features: usize,
        mode: &NormMode,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut down = Vec::with_capacity(num_blocks);
        for i in 0..num_blocks {
            let inp = if i == 0 {
                in_features
            } else {
                level_features(block_expansion, max_features, i)
            };
            let out = level_features(block_expansion, max_features, i + 1);
            down.push(DownBlock::new(inp, out, mode, vb.pp(format!("down{i}")))?);
        }

        let mut up = Vec::with_capacity(num_blocks);
        for i in (0..num_blocks).rev() {
            let mult = if i + 1 == num_blocks { 1 } else { 2 };
            let inp = mult * level_features(block_expansion, max_features, i + 1);
            let out = level_features(block_expansion, max_features, i);
            up.push(UpBlock::new(inp, out, mode, vb.pp(format!("up{i}")))?);
        }

        let out_features = if num_blocks == 0 {
            in_features
        } else {
            block_expansion.min(max_features) + in_features
        };
        Ok(Self { down, up, out_features })
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut skips = Vec::with_capacity(self.down.len());
        let mut out = x.clone();
        for block in &self.down {
            skips.push(out.clone());
            out = block.forward(&out)?;
        }
        for (block, skip) in self.up.iter().zip(skips.iter().rev()) {
            out = block.forward(&out)?;
            out = Tensor::cat(&[&out, skip], 1)?;
        }
        Ok(out)
    }
}

/// Output-size-preserving convolution with an odd kernel.
pub(crate) fn same_conv(in_features: usize, out_features: usize, kernel: usize, vb: VarBuilder) -> Result<Conv2d> {
    conv2d(in_features, out_features, kernel, padded(kernel / 2), vb)
}

/// Normalised pixel-centre coordinates in `[-1, 1]`, as two `(1, 1, H, W)`
/// tensors holding x (column) and y (row).
pub(crate) fn coordinate_grid(h: usize, w: usize, device: &candle_core::Device) -> Result<(Tensor, Tensor)> {
    let axis = |n: usize| -> Result<Tensor> {
        let step = if n > 1 { 2.0 / (n - 1) as f64 } else { 0.0 };
        let offset = if n > 1 { -1.0 } else { 0.0 };
        Tensor::arange(0u32, n as u32, device)?
            .to_dtype(candle_core::DType::F32)?
            .affine(step, offset)
    };
    let xs = axis(w)?.reshape((1, 1, 1, w))?.broadcast_as((1, 1, h, w))?.contiguous()?;
    let ys = axis(h)?.reshape((1, 1, h, 1))?.broadcast_as((1, 1, h, w))?.contiguous()?;
    Ok((xs, ys))
}

/// Mean over the two trailing (spatial) axes.
pub(crate) fn spatial_mean(x: &Tensor) -> Result<Tensor> {
    x.mean(D::Minus1)?.mean(D::Minus1)
}
