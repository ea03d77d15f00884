//! # animator-core: The Model
//!
//! The three trainable modules of the region animator and the joint
//! reconstruction step that ties them together:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`norm`] | `BatchNorm2d` with local or cross-replica (`StatsGroup`) statistics |
//! | [`blocks`] | `ConvBlock`, `DownBlock`, `UpBlock`, `Hourglass` |
//! | [`region`] | `RegionPredictor`, `RegionParams` |
//! | [`background`] | `BgPredictor` (zero / shift / affine background motion) |
//! | [`generator`] | `Generator` |
//! | [`loss`] | `LossBundle`, multi-scale L1, shift equivariance |
//! | [`model`] | `ReconstructionModel`, `ReconstructionOutput` |
//!
//! ## Design principles
//!
//! 1. **Modules do not own parameters.** Every module reads its weights
//!    through a `VarBuilder`; the training crate decides whether that is the
//!    live `VarMap` or a per-device replica view.
//! 2. **`Send + Sync`-safe.** Replicas run on scoped threads; the only shared
//!    mutable state is the `parking_lot`-guarded `StatsGroup`.
//! 3. **Pure forward.** A reconstruction step never mutates parameters.

pub mod background;
pub mod blocks;
pub mod generator;
pub mod loss;
pub mod model;
pub mod norm;
pub mod region;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use background::BgPredictor;
pub use generator::Generator;
pub use loss::{LossBundle, LossSettings};
pub use model::{ModuleBuilders, ReconstructionModel, ReconstructionOutput};
pub use norm::{BatchNorm2d, NormMode, StatsGroup, SyncLink};
pub use region::{RegionParams, RegionPredictor};
