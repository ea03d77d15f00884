//! Data pipeline: frame-pair datasets, repetition and batching.
//!
//! * **[`FramesDataset`]**: videos stored as folders of PNG/JPEG frames; every
//!   item is a (source, driving) pair sampled from one video.
//! * **[`InMemoryFrames`]**: pre-built pairs (synthetic data, tests).
//! * **[`DatasetRepeater`]**: repeats a dataset `n` times per epoch.
//! * **[`DataLoader`]**: deterministic shuffle, drop-last batching and a
//!   bounded pool of producer threads feeding the training thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::DatasetParams;
use crate::error::{Error, Result};

/// Batches each producer thread may hold ahead of the training thread.
const PREFETCH_BUFFER: usize = 4;

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

// ── Samples & batches ───────────────────────────────────────────────────────

/// One training example: two `(C, H, W)` frames of the same video.
#[derive(Debug, Clone)]
pub struct FramePair {
    pub source: Tensor,
    pub driving: Tensor,
}

/// A stack of frame pairs, `(B, C, H, W)` each.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source: Tensor,
    pub driving: Tensor,
}

impl Batch {
    /// Stack frame pairs along a new leading axis.
    pub fn collate(pairs: &[FramePair]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(Error::Dataset("cannot collate an empty batch".into()));
        }
        let sources: Vec<&Tensor> = pairs.iter().map(|p| &p.source).collect();
        let drivings: Vec<&Tensor> = pairs.iter().map(|p| &p.driving).collect();
        Ok(Self {
            source: Tensor::stack(&sources, 0)?,
            driving: Tensor::stack(&drivings, 0)?,
        })
    }

    /// Number of examples along the leading axis.
    pub fn len(&self) -> usize {
        self.source.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Examples `start..start + len`.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            source: self.source.narrow(0, start, len)?,
            driving: self.driving.narrow(0, start, len)?,
        })
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            source: self.source.to_device(device)?,
            driving: self.driving.to_device(device)?,
        })
    }

    /// Check the fixed batch schema and return `(B, C, H, W)`.
    ///
    /// Any deviation is a [`Error::ContractViolation`]: the dataset
    /// collaborator produced something the model cannot consume.
    pub fn validate(&self, num_channels: usize) -> Result<(usize, usize, usize, usize)> {
        let dims = self
            .source
            .dims4()
            .map_err(|_| Error::ContractViolation(format!(
                "source frames must be (B, C, H, W), got {:?}",
                self.source.dims()
            )))?;
        if self.driving.dims() != self.source.dims() {
            return Err(Error::ContractViolation(format!(
                "source {:?} and driving {:?} frames differ in shape",
                self.source.dims(),
                self.driving.dims()
            )));
        }
        if dims.0 == 0 {
            return Err(Error::ContractViolation("empty batch".into()));
        }
        if dims.1 != num_channels {
            return Err(Error::ContractViolation(format!(
                "expected {num_channels} channels, got {}",
                dims.1
            )));
        }
        if self.source.dtype() != DType::F32 || self.driving.dtype() != DType::F32 {
            return Err(Error::ContractViolation("frames must be f32".into()));
        }
        Ok(dims)
    }
}

// ── FrameDataset trait ──────────────────────────────────────────────────────

/// Random-access source of frame pairs.
///
/// `get` receives an RNG derived from the loader seed, the epoch and the
/// index, so any sampling inside the dataset stays reproducible.
pub trait FrameDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<FramePair>;
}

impl<D: FrameDataset + ?Sized> FrameDataset for Arc<D> {
    fn len(&self) -> usize {
        (**self).len()
    }
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<FramePair> {
        (**self).get(index, rng)
    }
}

// ── FramesDataset (on disk) ─────────────────────────────────────────────────

/// Videos stored as one directory of frames each.
///
/// ```text
/// root_dir/train/<video>/<frame>.png
/// root_dir/test/<video>/<frame>.png
/// ```
///
/// Without `train`/`test` sub-directories `root_dir` itself holds the videos.
pub struct FramesDataset {
    videos: Vec<Vec<PathBuf>>,
    frame_shape: [usize; 3],
}

impl FramesDataset {
    pub fn new(params: &DatasetParams) -> Result<Self> {
        let [_, _, channels] = params.frame_shape;
        if channels != 1 && channels != 3 {
            return Err(Error::Configuration(format!(
                "dataset_params.frame_shape must have 1 or 3 channels, got {channels}"
            )));
        }
        let split = if params.is_train { "train" } else { "test" };
        let root = if params.root_dir.join(split).is_dir() {
            params.root_dir.join(split)
        } else {
            params.root_dir.clone()
        };
        if !root.is_dir() {
            return Err(Error::Dataset(format!(
                "dataset directory not found: {}",
                root.display()
            )));
        }

        let mut video_dirs: Vec<PathBuf> = std::fs::read_dir(&root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        video_dirs.sort();

        let mut videos = Vec::with_capacity(video_dirs.len());
        for dir in &video_dirs {
            let frames = collect_frames(dir)?;
            if frames.is_empty() {
                tracing::warn!(video = %dir.display(), "skipping video without frames");
                continue;
            }
            videos.push(frames);
        }
        if videos.is_empty() {
            return Err(Error::Dataset(format!(
                "no videos with frames under {}",
                root.display()
            )));
        }
        tracing::info!(
            videos = videos.len(),
            root = %root.display(),
            "frames dataset ready"
        );
        Ok(Self {
            videos,
            frame_shape: params.frame_shape,
        })
    }

    /// Decode one frame into a `(C, H, W)` f32 tensor in `[0, 1]`.
    fn load_frame(&self, path: &Path) -> Result<Tensor> {
        let [height, width, channels] = self.frame_shape;
        let img = image::open(path)?.resize_exact(
            width as u32,
            height as u32,
            FilterType::Triangle,
        );
        let raw = if channels == 1 {
            img.to_luma8().into_raw()
        } else {
            img.to_rgb8().into_raw()
        };
        let frame = Tensor::from_vec(raw, (height, width, channels), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?
            .contiguous()?;
        Ok(frame)
    }
}

impl FrameDataset for FramesDataset {
    fn len(&self) -> usize {
        self.videos.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<FramePair> {
        let frames = self
            .videos
            .get(index)
            .ok_or_else(|| Error::Dataset(format!("video index {index} out of range")))?;
        // Sorted pair, sampled with replacement: the source never follows the driving frame.
        let mut picks = [rng.gen_range(0..frames.len()), rng.gen_range(0..frames.len())];
        picks.sort_unstable();
        Ok(FramePair {
            source: self.load_frame(&frames[picks[0]])?,
            driving: self.load_frame(&frames[picks[1]])?,
        })
    }
}

fn collect_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    frames.sort();
    Ok(frames)
}

// ── InMemoryFrames ──────────────────────────────────────────────────────────

/// Dataset over frame pairs already held in memory.
pub struct InMemoryFrames {
    pairs: Vec<FramePair>,
}

impl InMemoryFrames {
    pub fn new(pairs: Vec<FramePair>) -> Self {
        Self { pairs }
    }

    /// `len` synthetic pairs: a bright square that moves between the source
    /// and the driving frame over a flat background.
    pub fn synthetic(len: usize, channels: usize, height: usize, width: usize) -> Result<Self> {
        let side = (height.min(width) / 4).max(1);
        let mut pairs = Vec::with_capacity(len);
        for i in 0..len {
            let background = 0.1 + 0.2 * (i % 3) as f32;
            let (sy, sx) = ((i * 3) % (height - side + 1), (i * 5) % (width - side + 1));
            let (dy, dx) = (
                (sy + side / 2 + i) % (height - side + 1),
                (sx + side + 2 * i) % (width - side + 1),
            );
            let source = square_frame(channels, height, width, background, sy, sx, side)?;
            let driving = square_frame(channels, height, width, background, dy, dx, side)?;
            pairs.push(FramePair { source, driving });
        }
        Ok(Self { pairs })
    }
}

fn square_frame(
    channels: usize,
    height: usize,
    width: usize,
    background: f32,
    top: usize,
    left: usize,
    side: usize,
) -> Result<Tensor> {
    let mut data = vec![background; channels * height * width];
    for c in 0..channels {
        let value = 0.9 - 0.1 * c as f32;
        for y in top..top + side {
            for x in left..left + side {
                data[(c * height + y) * width + x] = value;
            }
        }
    }
    Ok(Tensor::from_vec(data, (channels, height, width), &Device::Cpu)?)
}

impl FrameDataset for InMemoryFrames {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize, _rng: &mut StdRng) -> Result<FramePair> {
        self.pairs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Dataset(format!("pair index {index} out of range")))
    }
}

// ── DatasetRepeater ─────────────────────────────────────────────────────────

/// Presents `inner` `num_repeats` times in a row, so one epoch covers the
/// underlying videos several times.
pub struct DatasetRepeater<D> {
    inner: D,
    num_repeats: usize,
}

impl<D: FrameDataset> DatasetRepeater<D> {
    pub fn new(inner: D, num_repeats: usize) -> Self {
        Self { inner, num_repeats }
    }
}

impl<D: FrameDataset> FrameDataset for DatasetRepeater<D> {
    fn len(&self) -> usize {
        self.inner.len() * self.num_repeats
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<FramePair> {
        let n = self.inner.len();
        if n == 0 {
            return Err(Error::Dataset("repeating an empty dataset".into()));
        }
        self.inner.get(index % n, rng)
    }
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Shuffling, drop-last batch loader.
///
/// Every epoch has its own permutation derived from `seed + epoch`, and every
/// item its own RNG, so a resumed run replays exactly the batches an
/// uninterrupted run would have seen. Trailing examples that cannot fill a
/// whole batch are dropped.
pub struct DataLoader {
    dataset: Arc<dyn FrameDataset>,
    batch_size: usize,
    num_workers: usize,
    seed: u64,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn FrameDataset>,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            num_workers,
            seed,
        }
    }

    /// `floor(len / batch_size)`.
    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.batch_size
    }

    /// Batches of one epoch, in a deterministic order.
    pub fn epoch(&self, epoch: usize) -> EpochBatches {
        let plan = epoch_plan(self.dataset.len(), self.batch_size, self.seed, epoch);
        let total = plan.len();
        let workers = self.num_workers.min(total);
        let source = if workers == 0 {
            BatchSource::Inline {
                dataset: Arc::clone(&self.dataset),
                plan,
                seed: self.seed,
                epoch,
            }
        } else {
            spawn_workers(&self.dataset, plan, workers, self.seed, epoch)
        };
        EpochBatches {
            source,
            next: 0,
            total,
        }
    }
}

/// Shuffled indices grouped into full batches; the remainder is dropped.
fn epoch_plan(len: usize, batch_size: usize, seed: u64, epoch: usize) -> Vec<Vec<usize>> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
    indices.shuffle(&mut rng);
    indices
        .chunks_exact(batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn item_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ ((epoch as u64) << 32) ^ index as u64
}

fn load_batch(
    dataset: &dyn FrameDataset,
    indices: &[usize],
    seed: u64,
    epoch: usize,
) -> Result<Batch> {
    let pairs = indices
        .iter()
        .map(|&i| {
            let mut rng = StdRng::seed_from_u64(item_seed(seed, epoch, i));
            dataset.get(i, &mut rng)
        })
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(&pairs)
}

fn spawn_workers(
    dataset: &Arc<dyn FrameDataset>,
    plan: Vec<Vec<usize>>,
    workers: usize,
    seed: u64,
    epoch: usize,
) -> BatchSource {
    let mut assignments: Vec<Vec<Vec<usize>>> = vec![Vec::new(); workers];
    for (k, indices) in plan.into_iter().enumerate() {
        assignments[k % workers].push(indices);
    }

    let mut receivers = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);
    for mine in assignments {
        let (tx, rx) = mpsc::sync_channel::<Result<Batch>>(PREFETCH_BUFFER);
        let dataset = Arc::clone(dataset);
        handles.push(thread::spawn(move || {
            for indices in mine {
                let batch = load_batch(dataset.as_ref(), &indices, seed, epoch);
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    return;
                }
            }
        }));
        receivers.push(rx);
    }
    BatchSource::Workers { receivers, handles }
}

enum BatchSource {
    Inline {
        dataset: Arc<dyn FrameDataset>,
        plan: Vec<Vec<usize>>,
        seed: u64,
        epoch: usize,
    },
    Workers {
        receivers: Vec<Receiver<Result<Batch>>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Iterator over the batches of one epoch.
///
/// With producer threads, batch `k` comes from worker `k % workers`, which
/// keeps the order identical to inline loading.
pub struct EpochBatches {
    source: BatchSource,
    next: usize,
    total: usize,
}

impl Iterator for EpochBatches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let k = self.next;
        self.next += 1;
        let item = match &self.source {
            BatchSource::Inline {
                dataset,
                plan,
                seed,
                epoch,
            } => load_batch(dataset.as_ref(), &plan[k], *seed, *epoch),
            BatchSource::Workers { receivers, .. } => receivers[k % receivers.len()]
                .recv()
                .unwrap_or_else(|_| Err(Error::Dataset("loader worker exited early".into()))),
        };
        Some(item)
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        if let BatchSource::Workers { receivers, handles } = &mut self.source {
            // Closing the channels unblocks producers waiting on a full queue.
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn loader(len: usize, batch_size: usize, workers: usize) -> DataLoader {
        let ds = InMemoryFrames::synthetic(len, 3, 8, 8).unwrap();
        DataLoader::new(Arc::new(ds), batch_size, workers, 7)
    }

    #[test]
    fn drop_last_yields_only_full_batches() {
        for workers in [0, 1, 3] {
            let loader = loader(7, 2, workers);
            assert_eq!(loader.batches_per_epoch(), 3);
            let batches: Vec<Batch> = loader.epoch(0).map(|b| b.unwrap()).collect();
            assert_eq!(batches.len(), 3);
            assert!(batches.iter().all(|b| b.len() == 2));
        }
    }

    #[test]
    fn dataset_smaller_than_batch_yields_nothing() {
        let loader = loader(3, 4, 2);
        assert_eq!(loader.epoch(0).count(), 0);
    }

    #[test]
    fn worker_order_matches_inline_order() {
        let inline: Vec<Vec<f32>> = loader(9, 2, 0)
            .epoch(3)
            .map(|b| values(&b.unwrap().source))
            .collect();
        let threaded: Vec<Vec<f32>> = loader(9, 2, 3)
            .epoch(3)
            .map(|b| values(&b.unwrap().source))
            .collect();
        assert_eq!(inline, threaded);
    }

    #[test]
    fn permutation_depends_only_on_seed_and_epoch() {
        assert_eq!(epoch_plan(10, 2, 1, 4), epoch_plan(10, 2, 1, 4));
        assert_ne!(epoch_plan(10, 2, 1, 4), epoch_plan(10, 2, 1, 5));
        let plan = epoch_plan(10, 3, 1, 0);
        assert_eq!(plan.len(), 3);
        let mut seen: Vec<usize> = plan.concat();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn repeater_cycles_inner_dataset() {
        let inner = InMemoryFrames::synthetic(3, 1, 8, 8).unwrap();
        let first = values(&inner.pairs[1].source);
        let repeated = DatasetRepeater::new(inner, 4);
        assert_eq!(repeated.len(), 12);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(values(&repeated.get(7, &mut rng).unwrap().source), first);
    }

    struct Failing;

    impl FrameDataset for Failing {
        fn len(&self) -> usize {
            4
        }
        fn get(&self, index: usize, _rng: &mut StdRng) -> Result<FramePair> {
            Err(Error::Dataset(format!("unreadable frame {index}")))
        }
    }

    #[test]
    fn worker_errors_reach_the_consumer() {
        let loader = DataLoader::new(Arc::new(Failing), 2, 2, 0);
        let mut epoch = loader.epoch(0);
        assert!(matches!(epoch.next(), Some(Err(Error::Dataset(_)))));
    }

    #[test]
    fn validate_rejects_mismatched_frames() {
        let pair = FramePair {
            source: Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu).unwrap(),
            driving: Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu).unwrap(),
        };
        let batch = Batch::collate(&[pair.clone(), pair]).unwrap();
        assert_eq!(batch.validate(3).unwrap(), (2, 3, 8, 8));
        assert!(matches!(batch.validate(1), Err(Error::ContractViolation(_))));

        let skewed = Batch {
            source: batch.source.clone(),
            driving: batch.driving.narrow(3, 0, 4).unwrap(),
        };
        assert!(matches!(skewed.validate(3), Err(Error::ContractViolation(_))));

        let flat = Batch {
            source: batch.source.flatten_all().unwrap(),
            driving: batch.driving.flatten_all().unwrap(),
        };
        assert!(matches!(flat.validate(3), Err(Error::ContractViolation(_))));
    }

    #[test]
    fn frames_dataset_reads_frame_folders() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("train").join("clip0");
        std::fs::create_dir_all(&video).unwrap();
        for i in 0..3u8 {
            let img = image::RgbImage::from_pixel(12, 10, image::Rgb([i * 80, 10, 200]));
            img.save(video.join(format!("{i:04}.png"))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("train").join("empty")).unwrap();

        let params = DatasetParams {
            root_dir: dir.path().to_path_buf(),
            frame_shape: [8, 8, 3],
            is_train: true,
        };
        let ds = FramesDataset::new(&params).unwrap();
        assert_eq!(ds.len(), 1);
        let mut rng = StdRng::seed_from_u64(3);
        let pair = ds.get(0, &mut rng).unwrap();
        assert_eq!(pair.source.dims(), &[3, 8, 8]);
        assert_eq!(pair.driving.dims(), &[3, 8, 8]);
        let blue = pair.source.narrow(0, 2, 1).unwrap().mean_all().unwrap();
        assert!((blue.to_scalar::<f32>().unwrap() - 200.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn frames_dataset_without_videos_fails() {
        let dir = tempfile::tempdir().unwrap();
        let params = DatasetParams {
            root_dir: dir.path().to_path_buf(),
            frame_shape: [8, 8, 3],
            is_train: true,
        };
        assert!(matches!(FramesDataset::new(&params), Err(Error::Dataset(_))));
    }
}
