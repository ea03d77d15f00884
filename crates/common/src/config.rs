//! Training configuration for the region animator.
//!
//! Loaded once from a YAML document at startup and never mutated afterwards.
//! Required sections are `model_params`, `train_params`, `visualizer_params`,
//! `dataset_params` and `log_dir`. Optional keys fall back to their
//! `#[serde(default)]` values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimatorConfig {
    pub model_params: ModelParams,
    pub train_params: TrainParams,
    pub visualizer_params: VisualizerParams,
    pub dataset_params: DatasetParams,
    /// Directory receiving logs, visualisations and checkpoints.
    pub log_dir: PathBuf,
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Hyper-parameters shared by the three trainable modules plus one
/// sub-record per module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    /// Number of motion regions predicted per frame.
    pub num_regions: usize,
    /// Image channels (3 for RGB, 1 for grayscale).
    pub num_channels: usize,
    /// Also estimate the second moments (shape) of every region.
    #[serde(default)]
    pub estimate_affine: bool,
    pub region_predictor_params: RegionPredictorParams,
    pub generator_params: GeneratorParams,
    pub bg_predictor_params: BgPredictorParams,
}

/// Hourglass region predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionPredictorParams {
    pub block_expansion: usize,
    pub max_features: usize,
    pub num_blocks: usize,
    /// Input downscaling before prediction; `0.25` pools by 4.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    /// Softmax temperature of the region heatmaps.
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

/// Hourglass generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorParams {
    pub block_expansion: usize,
    pub max_features: usize,
    pub num_blocks: usize,
}

/// Background motion predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgPredictorParams {
    pub block_expansion: usize,
    pub max_features: usize,
    pub num_blocks: usize,
    #[serde(default)]
    pub bg_type: BgMotion,
}

/// Family of global transforms the background predictor may emit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BgMotion {
    /// Identity: the background never moves.
    Zero,
    /// Translation only.
    Shift,
    /// Full 2×3 affine transform.
    #[default]
    Affine,
}

// ── Training ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainParams {
    /// Base learning rate.
    pub lr: f64,
    /// Adam `(beta1, beta2)`.
    #[serde(default = "default_betas")]
    pub betas: [f64; 2],
    /// Epochs at which the learning rate is multiplied by `gamma`.
    pub epoch_milestones: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Producer threads of the data loader; 0 loads on the training thread.
    pub dataloader_workers: usize,
    /// Checkpoint cadence in epochs.
    pub checkpoint_freq: usize,
    /// Logical repetitions of the dataset per epoch.
    #[serde(default)]
    pub num_repeats: Option<usize>,
    /// Synchronise normalisation statistics across device replicas.
    #[serde(default)]
    pub use_sync_bn: bool,
    /// Image pyramid scales of the reconstruction loss.
    #[serde(default = "default_scales")]
    pub scales: Vec<f64>,
    #[serde(default)]
    pub loss_weights: LossWeights,
    #[serde(default)]
    pub transform_params: TransformParams,
    /// Seed of the data loader shuffling and frame sampling.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossWeights {
    /// One weight per pyramid scale.
    #[serde(default = "default_reconstruction_weights")]
    pub reconstruction: Vec<f64>,
    /// Weight of the shift-equivariance term; 0 disables it.
    #[serde(default)]
    pub equivariance_shift: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformParams {
    /// Circular shift `(dx, dy)` in pixels used by the equivariance loss.
    #[serde(default = "default_shift")]
    pub shift: [i32; 2],
}

// ── Visualisation & data ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizerParams {
    /// Side of the square drawn at every region centre, in pixels.
    #[serde(default = "default_kp_size")]
    pub kp_size: usize,
    #[serde(default)]
    pub draw_border: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetParams {
    /// Directory of videos; each video is a folder of frames.
    pub root_dir: PathBuf,
    /// `[height, width, channels]` every frame is resized to.
    #[serde(default = "default_frame_shape")]
    pub frame_shape: [usize; 3],
    /// Read from `root_dir/train` when it exists.
    #[serde(default = "default_true")]
    pub is_train: bool,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_scale_factor() -> f64 {
    1.0
}
fn default_temperature() -> f64 {
    0.1
}
fn default_betas() -> [f64; 2] {
    [0.5, 0.999]
}
fn default_gamma() -> f64 {
    0.1
}
fn default_scales() -> Vec<f64> {
    vec![1.0, 0.5, 0.25, 0.125]
}
fn default_reconstruction_weights() -> Vec<f64> {
    vec![10.0; 4]
}
fn default_shift() -> [i32; 2] {
    [4, 4]
}
fn default_kp_size() -> usize {
    5
}
fn default_frame_shape() -> [usize; 3] {
    [256, 256, 3]
}
fn default_true() -> bool {
    true
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            reconstruction: default_reconstruction_weights(),
            equivariance_shift: 0.0,
        }
    }
}

impl Default for TransformParams {
    fn default() -> Self {
        Self {
            shift: default_shift(),
        }
    }
}

impl Default for VisualizerParams {
    fn default() -> Self {
        Self {
            kp_size: default_kp_size(),
            draw_border: false,
        }
    }
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl AnimatorConfig {
    /// Load the YAML configuration at `path`.
    ///
    /// A missing file is reported before anything else happens; in particular
    /// no directory is created.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration next to the run artefacts.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let t = &self.train_params;
        let m = &self.model_params;
        let checks = [
            (t.batch_size > 0, "train_params.batch_size must be positive"),
            (t.checkpoint_freq > 0, "train_params.checkpoint_freq must be positive"),
            (t.num_repeats != Some(0), "train_params.num_repeats must be positive"),
            (m.num_regions > 0, "model_params.num_regions must be positive"),
            (m.num_channels > 0, "model_params.num_channels must be positive"),
            (
                t.betas.iter().all(|b| (0.0..1.0).contains(b)),
                "train_params.betas must lie in [0, 1)",
            ),
            (
                t.scales.len() == t.loss_weights.reconstruction.len(),
                "train_params.loss_weights.reconstruction needs one weight per scale",
            ),
            (
                t.scales.iter().all(|s| *s > 0.0 && *s <= 1.0),
                "train_params.scales must lie in (0, 1]",
            ),
            (
                self.dataset_params.frame_shape[2] == m.num_channels,
                "dataset_params.frame_shape channels must equal model_params.num_channels",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, msg)) => Err(Error::Configuration((*msg).to_string())),
            None => Ok(()),
        }
    }
}

impl TrainParams {
    /// Repetition factor to wrap the dataset with, if any.
    ///
    /// The dataset is repeated only when `num_repeats` is present and differs
    /// from 1.
    pub fn repeat_factor(&self) -> Option<usize> {
        match self.num_repeats {
            Some(n) if n != 1 => Some(n),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL_YAML: &str = r#"
model_params:
  num_regions: 4
  num_channels: 3
  estimate_affine: true
  region_predictor_params:
    block_expansion: 8
    max_features: 32
    num_blocks: 2
    scale_factor: 0.5
  generator_params:
    block_expansion: 8
    max_features: 32
    num_blocks: 2
  bg_predictor_params:
    block_expansion: 8
    max_features: 32
    num_blocks: 2
    bg_type: shift
train_params:
  lr: 2.0e-4
  epoch_milestones: [60, 90]
  num_epochs: 100
  batch_size: 8
  dataloader_workers: 2
  checkpoint_freq: 10
  num_repeats: 50
visualizer_params:
  kp_size: 3
dataset_params:
  root_dir: data/frames
  frame_shape: [64, 64, 3]
log_dir: log/run
"#;

    #[test]
    fn parses_minimal_document_with_defaults() {
        let config = AnimatorConfig::from_yaml_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.model_params.num_regions, 4);
        assert_eq!(config.model_params.bg_predictor_params.bg_type, BgMotion::Shift);
        assert_eq!(config.model_params.region_predictor_params.temperature, 0.1);
        assert_eq!(config.train_params.betas, [0.5, 0.999]);
        assert_eq!(config.train_params.gamma, 0.1);
        assert_eq!(config.train_params.scales.len(), 4);
        assert!(!config.train_params.use_sync_bn);
        assert!(!config.visualizer_params.draw_border);
        assert_eq!(config.log_dir, PathBuf::from("log/run"));
    }

    #[test]
    fn missing_required_key_is_a_configuration_error() {
        let broken = MINIMAL_YAML.replace("  lr: 2.0e-4\n", "");
        match AnimatorConfig::from_yaml_str(&broken) {
            Err(Error::Configuration(msg)) => assert!(msg.contains("lr"), "{msg}"),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn zero_checkpoint_freq_is_rejected() {
        let broken = MINIMAL_YAML.replace("checkpoint_freq: 10", "checkpoint_freq: 0");
        assert!(matches!(
            AnimatorConfig::from_yaml_str(&broken),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn zero_repeats_are_rejected() {
        let broken = MINIMAL_YAML.replace("num_repeats: 50", "num_repeats: 0");
        assert!(matches!(
            AnimatorConfig::from_yaml_str(&broken),
            Err(Error::Configuration(msg)) if msg.contains("num_repeats")
        ));
    }

    #[test]
    fn missing_file_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        match AnimatorConfig::load(&path) {
            Err(Error::ConfigNotFound { path: p }) => assert_eq!(p, path),
            other => panic!("expected ConfigNotFound, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn repeat_factor_only_when_present_and_not_one() {
        let mut config = AnimatorConfig::from_yaml_str(MINIMAL_YAML).unwrap();
        assert_eq!(config.train_params.repeat_factor(), Some(50));
        config.train_params.num_repeats = Some(1);
        assert_eq!(config.train_params.repeat_factor(), None);
        config.train_params.num_repeats = None;
        assert_eq!(config.train_params.repeat_factor(), None);
    }

    #[test]
    fn save_and_load_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = AnimatorConfig::from_yaml_str(MINIMAL_YAML).unwrap();
        config.save(&path).unwrap();
        let loaded = AnimatorConfig::load(&path).unwrap();
        assert_eq!(loaded.train_params.epoch_milestones, vec![60, 90]);
        assert_eq!(loaded.dataset_params.frame_shape, [64, 64, 3]);
    }

    #[test]
    fn shipped_vox_config_is_valid() {
        let config =
            AnimatorConfig::from_yaml_str(include_str!("../../../config/vox-256.yaml")).unwrap();
        assert_eq!(config.model_params.num_regions, 10);
        assert_eq!(config.train_params.repeat_factor(), Some(50));
        assert!(config.train_params.use_sync_bn);
    }
}
