//! Training log: loss history, reconstruction snapshots, final checkpoint.
//!
//! [`Logger`] writes into the run's `log_dir`:
//!
//! * `log.txt`: one line per epoch, `"{epoch:08}) name - value; ..."` with
//!   each term averaged over the epoch's steps.
//! * `metrics.jsonl`: the same averages as one JSON object per epoch,
//!   together with the learning rate and step count.
//! * `train-vis/{epoch:08}-rec.png`: the epoch's last batch as rendered by
//!   the [`Visualizer`].
//!
//! Files are flushed at every epoch and when the logger is dropped, so they
//! are complete on every exit path.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use animator_common::{Batch, Result, VisualizerParams};
use animator_core::ReconstructionOutput;
use serde::Serialize;

use crate::checkpoint::CheckpointStore;
use crate::trainer::{StepMetrics, TrainingState};
use crate::visualize::Visualizer;

/// Input and (detached) output of the last step of an epoch.
pub struct EpochSample {
    pub batch: Batch,
    pub output: ReconstructionOutput,
}

/// Sink for the training loop's progress.
pub trait TrainingLog {
    /// After every optimizer step.
    fn log_iter(&mut self, metrics: &StepMetrics) -> Result<()>;

    /// At every epoch boundary, after the cursor moved past `epoch`.
    fn log_epoch(&mut self, epoch: usize, state: &TrainingState, sample: Option<&EpochSample>) -> Result<()>;

    /// Once, when the run reaches its last epoch. `persisted` is the last
    /// epoch tag the checkpoint cadence wrote during this run, if any.
    fn finish(&mut self, state: &TrainingState, persisted: Option<usize>) -> Result<()>;
}

#[derive(Serialize)]
struct EpochRecord<'a> {
    epoch: usize,
    steps: usize,
    lr: f64,
    losses: &'a BTreeMap<String, f32>,
}

pub struct Logger {
    vis_dir: PathBuf,
    log_file: BufWriter<File>,
    metrics_file: BufWriter<File>,
    visualizer: Visualizer,
    store: CheckpointStore,
    epoch_losses: Vec<BTreeMap<String, f32>>,
    last_lr: f64,
    last_epoch: Option<usize>,
}

impl Logger {
    /// Open (appending) the log files under `log_dir`, creating it if needed.
    pub fn new(log_dir: &Path, visualizer: &VisualizerParams) -> Result<Self> {
        let vis_dir = log_dir.join("train-vis");
        std::fs::create_dir_all(&vis_dir)?;
        let append = |name: &str| -> Result<BufWriter<File>> {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_dir.join(name))?;
            Ok(BufWriter::new(file))
        };
        Ok(Self {
            log_file: append("log.txt")?,
            metrics_file: append("metrics.jsonl")?,
            vis_dir,
            visualizer: Visualizer::new(visualizer),
            store: CheckpointStore::new(log_dir),
            epoch_losses: Vec::new(),
            last_lr: 0.0,
            last_epoch: None,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.log_file.flush()?;
        self.metrics_file.flush()?;
        Ok(())
    }
}

/// Per-term mean over the epoch's steps.
fn average(history: &[BTreeMap<String, f32>]) -> BTreeMap<String, f32> {
    let mut sums: BTreeMap<String, (f32, usize)> = BTreeMap::new();
    for step in history {
        for (name, value) in step {
            let entry = sums.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(name, (sum, n))| (name, sum / n as f32))
        .collect()
}

impl TrainingLog for Logger {
    fn log_iter(&mut self, metrics: &StepMetrics) -> Result<()> {
        self.epoch_losses.push(metrics.losses.clone());
        self.last_lr = metrics.lr;
        Ok(())
    }

    fn log_epoch(&mut self, epoch: usize, _state: &TrainingState, sample: Option<&EpochSample>) -> Result<()> {
        let losses = average(&self.epoch_losses);
        let line = losses
            .iter()
            .map(|(name, value)| format!("{name} - {value:.5}"))
            .collect::<Vec<_>>()
            .join("; ");
        writeln!(self.log_file, "{epoch:08}) {line}")?;

        let record = EpochRecord {
            epoch,
            steps: self.epoch_losses.len(),
            lr: self.last_lr,
            losses: &losses,
        };
        serde_json::to_writer(&mut self.metrics_file, &record)?;
        writeln!(self.metrics_file)?;

        if let Some(sample) = sample {
            let image = self.visualizer.render(&sample.batch, &sample.output)?;
            image.save(self.vis_dir.join(format!("{epoch:08}-rec.png")))?;
        }

        self.epoch_losses.clear();
        self.last_epoch = Some(epoch);
        self.flush()
    }

    /// Persist a checkpoint of the last logged epoch unless this run's
    /// cadence already wrote that tag. A file left under the same tag by an
    /// earlier run is overwritten.
    fn finish(&mut self, state: &TrainingState, persisted: Option<usize>) -> Result<()> {
        if let Some(epoch) = self.last_epoch {
            if persisted != Some(epoch) {
                self.store.persist(epoch, state)?;
            }
        }
        self.flush()
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush training log");
        }
    }
}
