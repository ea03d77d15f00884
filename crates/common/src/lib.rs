//! # animator-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`AnimatorConfig`]**: the YAML training configuration.
//! * **[`Error`]**: the error taxonomy every fallible call returns.
//! * **[`FrameDataset`]** / **[`DataLoader`]**: frame pairs and batching.
//! * **[`Batch`]**: the fixed-schema input of one training step.

pub mod config;
pub mod data;
pub mod error;

pub use config::{
    AnimatorConfig, BgMotion, BgPredictorParams, DatasetParams, GeneratorParams, LossWeights,
    ModelParams, RegionPredictorParams, TrainParams, TransformParams, VisualizerParams,
};
pub use data::{
    Batch, DataLoader, DatasetRepeater, EpochBatches, FrameDataset, FramePair, FramesDataset,
    InMemoryFrames,
};
pub use error::{Error, Result};
