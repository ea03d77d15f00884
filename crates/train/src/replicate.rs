//! Execution strategies for the joint reconstruction step.
//!
//! A strategy is chosen once at startup and then run on every batch:
//!
//! * **SingleDevice**: the live model on the coordinating device.
//! * **Replicated**: the batch is cut into near-equal shards along the
//!   leading axis, one replica per device on a scoped thread, normalisation
//!   statistics per shard.
//! * **ReplicatedSynced**: as `Replicated`, with normalisation statistics
//!   all-reduced across replicas so they cover the whole batch.
//!
//! Replicas read the live parameters through device copies that stay on the
//! autograd graph; shard losses and outputs are gathered onto the
//! coordinating device in shard order, so the loss reduction sees every
//! example exactly once.

use std::thread;

use animator_common::{Batch, Error, Result};
use animator_core::{LossBundle, NormMode, ReconstructionOutput, StatsGroup};
use candle_core::Device;

use crate::modules::{ModuleSet, ParameterSet};

/// Result of one (possibly replicated) reconstruction step on the
/// coordinating device.
pub struct StepOutput {
    pub losses: LossBundle,
    pub output: ReconstructionOutput,
}

#[derive(Debug, Clone)]
pub enum ExecutionStrategy {
    SingleDevice,
    Replicated { devices: Vec<Device> },
    ReplicatedSynced { devices: Vec<Device> },
}

impl ExecutionStrategy {
    /// Pick the coordinating device and strategy for `device_ids`.
    ///
    /// Without CUDA the run falls back to a single CPU device; that is not an
    /// error.
    pub fn select(device_ids: &[usize], use_sync_bn: bool) -> Result<(Device, Self)> {
        if !candle_core::utils::cuda_is_available() {
            tracing::info!(
                requested = ?device_ids,
                "no CUDA device available, training on a single CPU device"
            );
            return Ok((Device::Cpu, Self::SingleDevice));
        }
        let ids = if device_ids.is_empty() { &[0][..] } else { device_ids };
        let devices = ids
            .iter()
            .map(|&id| Device::new_cuda(id))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let coordinator = devices[0].clone();
        let strategy = Self::over(devices, use_sync_bn);
        tracing::info!(devices = ?ids, strategy = strategy.name(), "execution strategy selected");
        Ok((coordinator, strategy))
    }

    /// Strategy over explicit devices: one device runs alone, more are
    /// replicated.
    pub fn over(devices: Vec<Device>, use_sync_bn: bool) -> Self {
        match (devices.len(), use_sync_bn) {
            (0 | 1, _) => Self::SingleDevice,
            (_, false) => Self::Replicated { devices },
            (_, true) => Self::ReplicatedSynced { devices },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SingleDevice => "single-device",
            Self::Replicated { .. } => "replicated",
            Self::ReplicatedSynced { .. } => "replicated-synced",
        }
    }

    pub fn num_devices(&self) -> usize {
        match self {
            Self::SingleDevice => 1,
            Self::Replicated { devices } | Self::ReplicatedSynced { devices } => devices.len(),
        }
    }

    /// Run the reconstruction step on `batch`.
    pub fn run(&self, modules: &ModuleSet, parameters: &ParameterSet, batch: &Batch) -> Result<StepOutput> {
        match self {
            Self::SingleDevice => {
                let batch = batch.to_device(modules.device())?;
                let (losses, output) = modules.model().forward(&batch)?;
                Ok(StepOutput { losses, output })
            }
            Self::Replicated { devices } => run_replicas(modules, parameters, batch, devices, false),
            Self::ReplicatedSynced { devices } => run_replicas(modules, parameters, batch, devices, true),
        }
    }
}

/// Near-equal shard sizes: the first `batch % n` shards take one extra
/// example. Never produces an empty shard, so fewer than `devices` shards
/// are returned for batches smaller than the device count.
pub fn shard_sizes(batch: usize, devices: usize) -> Vec<usize> {
    let n = devices.min(batch);
    if n == 0 {
        return Vec::new();
    }
    let (base, extra) = (batch / n, batch % n);
    (0..n).map(|i| base + usize::from(i < extra)).collect()
}

/// Aborts the statistics group unless disarmed, so a replica that errors or
/// panics never leaves the others waiting.
struct AbortGuard<'a> {
    group: Option<&'a StatsGroup>,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(group) = self.group {
                group.abort();
            }
        }
    }
}

/// A replica that returned an error.
struct ReplicaFailure {
    error: Error,
    /// The replica failed on its own account rather than because another
    /// replica aborted the statistics group.
    root_cause: bool,
}

/// The error to report for a failed step: the first root-cause failure in
/// rank order, else the first failure. Returned unchanged.
fn first_root_cause(failures: Vec<ReplicaFailure>) -> Option<Error> {
    let pick = failures.iter().position(|f| f.root_cause).unwrap_or(0);
    failures.into_iter().nth(pick).map(|f| f.error)
}

fn run_replicas(
    modules: &ModuleSet,
    parameters: &ParameterSet,
    batch: &Batch,
    devices: &[Device],
    synced: bool,
) -> Result<StepOutput> {
    modules.model().check_batch(batch)?;
    let sizes = shard_sizes(batch.len(), devices.len());
    let group = synced.then(|| StatsGroup::new(sizes.len()));
    let links = group.as_ref().map(|g| g.links());

    let mut shards = Vec::with_capacity(sizes.len());
    let mut start = 0;
    for (rank, &len) in sizes.iter().enumerate() {
        let mode = match &links {
            Some(links) => NormMode::Synced(links[rank].clone()),
            None => NormMode::Local,
        };
        shards.push((rank, start, len, mode));
        start += len;
    }

    type ReplicaResult = (Result<(LossBundle, ReconstructionOutput)>, bool);
    let results: Vec<ReplicaResult> = thread::scope(|s| {
        let handles: Vec<_> = shards
            .into_iter()
            .map(|(rank, start, len, mode)| {
                let device = &devices[rank];
                let group = group.as_deref();
                s.spawn(move || {
                    let mut guard = AbortGuard { group, armed: true };
                    let result = batch
                        .narrow(start, len)
                        .and_then(|shard| shard.to_device(device))
                        .and_then(|shard| {
                            let replica = modules.replica(parameters, device, mode)?;
                            replica.forward(&shard)
                        });
                    guard.armed = false;
                    let root_cause = match (&result, group) {
                        (Ok(_), _) => false,
                        (Err(_), Some(group)) => group.abort(),
                        (Err(_), None) => true,
                    };
                    (result, root_cause)
                })
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, h)| {
                h.join().unwrap_or_else(|_| {
                    (Err(Error::Replication(format!("replica {rank} panicked"))), true)
                })
            })
            .collect()
    });

    let mut bundles = Vec::with_capacity(results.len());
    let mut outputs = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (rank, (result, root_cause)) in results.into_iter().enumerate() {
        match result {
            Ok((losses, output)) => {
                bundles.push(losses);
                outputs.push(output);
            }
            Err(error) => {
                tracing::error!(rank, root_cause, error = %error, "replica failed");
                failures.push(ReplicaFailure { error, root_cause });
            }
        }
    }
    if let Some(error) = first_root_cause(failures) {
        return Err(error);
    }

    let coordinator = modules.device();
    Ok(StepOutput {
        losses: LossBundle::concat(&bundles, coordinator)?,
        output: ReconstructionOutput::concat(&outputs, coordinator)?,
    })
}
