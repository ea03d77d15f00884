//! Reconstruction snapshots as PNG grids.
//!
//! One row per example: source | driving | prediction. Region centres are
//! drawn on the source and driving tiles as coloured squares, one hue per
//! region.

use animator_common::{Batch, Result, VisualizerParams};
use animator_core::ReconstructionOutput;
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};

/// Rows rendered at most; larger batches are cut.
const MAX_ROWS: usize = 8;

pub struct Visualizer {
    kp_size: usize,
    draw_border: bool,
}

/// One `(H, W)` tile as interleaved RGB floats in `[0, 1]`.
struct Tile {
    h: usize,
    w: usize,
    rgb: Vec<f32>,
}

impl Visualizer {
    pub fn new(params: &VisualizerParams) -> Self {
        Self {
            kp_size: params.kp_size,
            draw_border: params.draw_border,
        }
    }

    pub fn render(&self, batch: &Batch, output: &ReconstructionOutput) -> Result<RgbImage> {
        let rows = batch.len().min(MAX_ROWS);
        let (_, _, h, w) = batch.source.dims4()?;
        let mut canvas = RgbImage::new((3 * w) as u32, (rows * h) as u32);

        let source_shift = to_cpu(&output.source_regions.shift)?;
        let driving_shift = to_cpu(&output.driving_regions.shift)?;
        for row in 0..rows {
            let columns = [
                (tile(&batch.source, row)?, Some(source_shift.get(row)?)),
                (tile(&batch.driving, row)?, Some(driving_shift.get(row)?)),
                (tile(&output.prediction, row)?, None),
            ];
            for (col, (pixels, regions)) in columns.into_iter().enumerate() {
                let (x0, y0) = ((col * w) as u32, (row * h) as u32);
                self.blit(&mut canvas, &pixels, x0, y0);
                if let Some(regions) = regions {
                    self.draw_regions(&mut canvas, &regions, &pixels, x0, y0)?;
                }
            }
        }
        Ok(canvas)
    }

    fn blit(&self, canvas: &mut RgbImage, tile: &Tile, x0: u32, y0: u32) {
        for y in 0..tile.h {
            for x in 0..tile.w {
                let i = (y * tile.w + x) * 3;
                let px = |c: usize| (tile.rgb[i + c].clamp(0.0, 1.0) * 255.0).round() as u8;
                let on_border = self.draw_border && (x == 0 || y == 0 || x + 1 == tile.w || y + 1 == tile.h);
                let color = if on_border {
                    Rgb([255, 255, 255])
                } else {
                    Rgb([px(0), px(1), px(2)])
                };
                canvas.put_pixel(x0 + x as u32, y0 + y as u32, color);
            }
        }
    }

    /// `regions` is `(K, 2)` of `(x, y)` in `[-1, 1]`.
    fn draw_regions(&self, canvas: &mut RgbImage, regions: &Tensor, tile: &Tile, x0: u32, y0: u32) -> Result<()> {
        let centres = regions.to_vec2::<f32>()?;
        let k = centres.len();
        let half = (self.kp_size / 2) as i64;
        for (idx, centre) in centres.iter().enumerate() {
            let cx = ((centre[0] + 1.0) / 2.0 * (tile.w - 1) as f32).round() as i64;
            let cy = ((centre[1] + 1.0) / 2.0 * (tile.h - 1) as f32).round() as i64;
            let color = hue(idx as f32 / k.max(1) as f32);
            for y in (cy - half)..=(cy + half) {
                for x in (cx - half)..=(cx + half) {
                    if x >= 0 && y >= 0 && (x as usize) < tile.w && (y as usize) < tile.h {
                        canvas.put_pixel(x0 + x as u32, y0 + y as u32, color);
                    }
                }
            }
        }
        Ok(())
    }
}

fn to_cpu(t: &Tensor) -> Result<Tensor> {
    Ok(t.detach().to_device(&Device::Cpu)?.to_dtype(DType::F32)?)
}

/// Example `row` of a `(B, C, H, W)` tensor as an RGB tile. Single-channel
/// images are shown in grey; extra channels beyond three are ignored.
fn tile(images: &Tensor, row: usize) -> Result<Tile> {
    let image = to_cpu(images)?.get(row)?;
    let (c, h, w) = image.dims3()?;
    let rgb = match c {
        1 => Tensor::cat(&[&image, &image, &image], 0)?,
        2 => Tensor::cat(&[&image, &image.narrow(0, 0, 1)?], 0)?,
        _ => image.narrow(0, 0, 3)?,
    };
    let rgb = rgb.permute((1, 2, 0))?.flatten_all()?.to_vec1::<f32>()?;
    Ok(Tile { h, w, rgb })
}

/// Fully saturated colour at `t` in `[0, 1)` around the hue wheel.
fn hue(t: f32) -> Rgb<u8> {
    let h = (t.fract() * 6.0).max(0.0);
    let x = 1.0 - ((h % 2.0) - 1.0).abs();
    let (r, g, b) = match h as u32 {
        0 => (1.0, x, 0.0),
        1 => (x, 1.0, 0.0),
        2 => (0.0, 1.0, x),
        3 => (0.0, x, 1.0),
        4 => (x, 0.0, 1.0),
        _ => (1.0, 0.0, x),
    };
    let byte = |v: f32| (v * 255.0).round() as u8;
    Rgb([byte(r), byte(g), byte(b)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleSet;
    use crate::tests::{tiny_batch, tiny_config};

    #[test]
    fn grid_has_three_tiles_per_example() {
        let config = tiny_config();
        let modules = ModuleSet::new(&config, &Device::Cpu).unwrap();
        let batch = tiny_batch(2);
        let (_, output) = modules.model().forward(&batch).unwrap();
        let mut params = config.visualizer_params.clone();
        params.draw_border = true;
        let image = Visualizer::new(&params).render(&batch, &output).unwrap();
        assert_eq!(image.dimensions(), (48, 32));
        assert_eq!(image.get_pixel(32, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn hues_are_distinct() {
        assert_eq!(hue(0.0), Rgb([255, 0, 0]));
        assert_ne!(hue(1.0 / 3.0), hue(2.0 / 3.0));
    }
}
