//! # animator-train: The Training Engine
//!
//! Optimisation, scheduling, persistence and replication for the region
//! animator:
//!
//! * **[`Trainer`]**: owns the [`TrainingState`] and drives the epoch loop.
//!   One call to [`Trainer::step`] runs the (possibly replicated)
//!   reconstruction step, backward and one Adam update.
//! * **[`ParameterSet`]**: the fixed list of trainable tensors shared by the
//!   optimizer and the checkpoint store.
//! * **[`MultiStepLr`]**: step decay at epoch milestones.
//! * **[`CheckpointStore`]**: atomic, epoch-tagged safetensors snapshots.
//! * **[`ExecutionStrategy`]**: single device, replicated, or replicated
//!   with synchronised normalisation statistics.
//! * **[`Logger`]**: loss history, reconstruction PNGs, final checkpoint.

pub mod checkpoint;
pub mod logger;
pub mod modules;
pub mod optimizer;
pub mod replicate;
pub mod scheduler;
pub mod trainer;
pub mod visualize;

pub use checkpoint::{CheckpointStore, CHECKPOINT_VERSION};
pub use logger::{EpochSample, Logger, TrainingLog};
pub use modules::{ModuleKind, ModuleSet, Parameter, ParameterSet};
pub use optimizer::{Adam, AdamParams, MomentState};
pub use replicate::{shard_sizes, ExecutionStrategy, StepOutput};
pub use scheduler::MultiStepLr;
pub use trainer::{StepMetrics, TrainPhase, Trainer, TrainingState};
pub use visualize::Visualizer;
