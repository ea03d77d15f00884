//! Trainer: the epoch-level training loop.
//!
//! Decouples the compute graph (the replicated reconstruction step) from the
//! optimisation step (backward, Adam, gradient release) and drives the run
//! through its phases:
//!
//! ```text
//! Initializing -> EpochRunning -> EpochBoundary -+-> Checkpointing -+-> EpochRunning
//!                      ^                         |                  '-> Finished
//!                      '-------------------------+-> Finished
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use animator_common::{AnimatorConfig, Batch, DataLoader, DatasetRepeater, FrameDataset, Result};
use candle_core::Device;
use indicatif::{ProgressBar, ProgressStyle};

use crate::checkpoint::CheckpointStore;
use crate::logger::{EpochSample, TrainingLog};
use crate::modules::{ModuleSet, ParameterSet};
use crate::optimizer::{Adam, AdamParams};
use crate::replicate::{ExecutionStrategy, StepOutput};
use crate::scheduler::MultiStepLr;

// ── State ───────────────────────────────────────────────────────────────────

/// Everything a checkpoint captures: module parameters, optimizer state and
/// the epoch cursor.
pub struct TrainingState {
    pub modules: ModuleSet,
    pub parameters: ParameterSet,
    pub optimizer: Adam,
    /// Epochs completed; the next epoch to run.
    pub epoch: usize,
}

impl TrainingState {
    /// Fresh modules, the parameter set over them and zeroed optimizer
    /// moments, in that order.
    pub fn new(config: &AnimatorConfig, device: &Device) -> Result<Self> {
        let modules = ModuleSet::new(config, device)?;
        let parameters = ParameterSet::collect(&modules)?;
        let optimizer = Adam::new(&parameters, AdamParams::from_train_params(&config.train_params))?;
        Ok(Self {
            modules,
            parameters,
            optimizer,
            epoch: 0,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    Initializing,
    EpochRunning,
    EpochBoundary,
    Checkpointing,
    Finished,
}

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub epoch: usize,
    /// The optimised scalar: sum of the term means.
    pub loss: f32,
    /// Mean of each loss term over the batch.
    pub losses: BTreeMap<String, f32>,
    pub lr: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the training state, the schedule and the
/// execution strategy.
pub struct Trainer {
    config: AnimatorConfig,
    state: TrainingState,
    scheduler: MultiStepLr,
    strategy: ExecutionStrategy,
    store: CheckpointStore,
    phase: TrainPhase,
    global_step: usize,
}

impl Trainer {
    /// Build the modules and optimizer on `device`, restoring `checkpoint`
    /// when given. The schedule is positioned on the restored epoch.
    pub fn new(
        config: AnimatorConfig,
        device: Device,
        strategy: ExecutionStrategy,
        checkpoint: Option<&Path>,
    ) -> Result<Self> {
        let mut state = TrainingState::new(&config, &device)?;
        if let Some(path) = checkpoint {
            CheckpointStore::restore(path, &mut state)?;
        }
        let t = &config.train_params;
        let scheduler = MultiStepLr::new(t.epoch_milestones.clone(), t.gamma, state.epoch);

        tracing::info!(
            parameters = state.parameters.len(),
            elements = state.parameters.num_elements(),
            start_epoch = state.epoch,
            num_epochs = t.num_epochs,
            strategy = strategy.name(),
            devices = strategy.num_devices(),
            "trainer ready"
        );

        Ok(Self {
            store: CheckpointStore::new(&config.log_dir),
            config,
            state,
            scheduler,
            strategy,
            phase: TrainPhase::Initializing,
            global_step: 0,
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn scheduler(&self) -> &MultiStepLr {
        &self.scheduler
    }

    /// Optimizer steps taken by this trainer.
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn current_lr(&self) -> f64 {
        self.scheduler.lr(self.config.train_params.lr)
    }

    /// One optimisation step: reconstruction (through the execution
    /// strategy), scalar loss, backward, one Adam update. Gradients are
    /// released before returning.
    pub fn step(&mut self, batch: &Batch) -> Result<(StepMetrics, StepOutput)> {
        let out = self
            .strategy
            .run(&self.state.modules, &self.state.parameters, batch)?;
        let total = out.losses.total()?;
        let losses = out.losses.means()?;
        let loss = total.to_scalar::<f32>()?;

        let lr = self.current_lr();
        let grads = total.backward()?;
        self.state
            .optimizer
            .step(&self.state.parameters, &grads, lr)?;
        drop(grads);

        let metrics = StepMetrics {
            step: self.global_step,
            epoch: self.state.epoch,
            loss,
            losses,
            lr,
        };
        self.global_step += 1;
        tracing::debug!(step = metrics.step, epoch = metrics.epoch, loss = metrics.loss, "step");
        Ok((metrics, out))
    }

    /// Train until the epoch cursor reaches `num_epochs`.
    ///
    /// The dataset is wrapped in a [`DatasetRepeater`] when `num_repeats` asks
    /// for it. Any error aborts the run; the latest checkpoint is the restart
    /// point.
    pub fn train(&mut self, dataset: Arc<dyn FrameDataset>, log: &mut dyn TrainingLog) -> Result<()> {
        let t = &self.config.train_params;
        let dataset: Arc<dyn FrameDataset> = match t.repeat_factor() {
            Some(n) => Arc::new(DatasetRepeater::new(dataset, n)),
            None => dataset,
        };
        let loader = DataLoader::new(dataset, t.batch_size, t.dataloader_workers, t.seed);
        let (num_epochs, checkpoint_freq) = (t.num_epochs, t.checkpoint_freq);
        tracing::info!(
            batches_per_epoch = loader.batches_per_epoch(),
            start_epoch = self.state.epoch,
            num_epochs,
            "training"
        );

        self.phase = TrainPhase::Initializing;
        let mut sample: Option<EpochSample> = None;
        let bar = epoch_bar(self.state.epoch, num_epochs);
        let mut persisted: Option<usize> = None;

        loop {
            match self.phase {
                TrainPhase::Initializing => {
                    self.phase = if self.state.epoch >= num_epochs {
                        TrainPhase::Finished
                    } else {
                        TrainPhase::EpochRunning
                    };
                }
                TrainPhase::EpochRunning => {
                    let epoch = self.state.epoch;
                    for batch in loader.epoch(epoch) {
                        let batch = batch?;
                        let (metrics, out) = self.step(&batch)?;
                        log.log_iter(&metrics)?;
                        sample = Some(EpochSample {
                            batch,
                            output: out.output.detach(),
                        });
                    }
                    self.phase = TrainPhase::EpochBoundary;
                }
                TrainPhase::EpochBoundary => {
                    let finished_epoch = self.state.epoch;
                    self.scheduler.advance();
                    self.state.epoch += 1;
                    log.log_epoch(finished_epoch, &self.state, sample.take().as_ref())?;
                    bar.inc(1);
                    bar.set_message(format!("lr {:.2e}", self.current_lr()));
                    tracing::info!(
                        epoch = finished_epoch,
                        lr = self.current_lr(),
                        decays = self.scheduler.decay_count(),
                        "epoch done"
                    );
                    self.phase = if self.state.epoch % checkpoint_freq == 0 {
                        TrainPhase::Checkpointing
                    } else if self.state.epoch >= num_epochs {
                        TrainPhase::Finished
                    } else {
                        TrainPhase::EpochRunning
                    };
                }
                TrainPhase::Checkpointing => {
                    let tag = self.state.epoch - 1;
                    self.store.persist(tag, &self.state)?;
                    persisted = Some(tag);
                    self.phase = if self.state.epoch >= num_epochs {
                        TrainPhase::Finished
                    } else {
                        TrainPhase::EpochRunning
                    };
                }
                TrainPhase::Finished => {
                    log.finish(&self.state, persisted)?;
                    bar.finish_with_message("done");
                    tracing::info!(epoch = self.state.epoch, steps = self.global_step, "training finished");
                    return Ok(());
                }
            }
        }
    }
}

fn epoch_bar(start: usize, total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40} {pos}/{len} epochs {msg}") {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.set_position(start.min(total) as u64);
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tiny_config;

    #[test]
    fn step_updates_parameters_once() {
        let mut trainer = Trainer::new(tiny_config(), Device::Cpu, ExecutionStrategy::SingleDevice, None).unwrap();
        let batch = crate::tests::tiny_batch(2);
        let (metrics, out) = trainer.step(&batch).unwrap();
        assert_eq!(metrics.step, 0);
        assert!(metrics.loss.is_finite());
        assert!(metrics.losses.contains_key("reconstruction"));
        assert_eq!(out.losses.get("reconstruction").unwrap().dims(), &[2]);
        assert_eq!(trainer.global_step(), 1);
        assert_eq!(trainer.state().optimizer.step_count(), 1);
    }

    #[test]
    fn restored_trainer_resumes_schedule_at_checkpoint_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config();
        config.train_params.epoch_milestones = vec![5, 10];
        let state = TrainingState::new(&config, &Device::Cpu).unwrap();
        let path = CheckpointStore::new(dir.path()).persist(5, &state).unwrap();

        let trainer = Trainer::new(config.clone(), Device::Cpu, ExecutionStrategy::SingleDevice, Some(&path)).unwrap();
        assert_eq!(trainer.state().epoch, 5);
        assert_eq!(trainer.scheduler().decay_count(), 1);
        assert!((trainer.current_lr() - config.train_params.lr * 0.1).abs() < 1e-12);
    }

    #[test]
    fn missing_checkpoint_stops_construction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.safetensors");
        let result = Trainer::new(tiny_config(), Device::Cpu, ExecutionStrategy::SingleDevice, Some(&path));
        assert!(matches!(result, Err(animator_common::Error::CheckpointNotFound { .. })));
    }
}
