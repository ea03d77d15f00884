//! Batch normalisation with optional cross-replica statistics.
//!
//! Statistics are reduced from per-channel `(sum, sum of squares, count)`
//! moments. A replica on its own normalises with its own moments; replicas of
//! a synchronised [`StatsGroup`] all-reduce their moments first, so every shard
//! is normalised with the statistics of the whole batch. The reduced moments
//! keep their autograd history, so gradients flow back into every shard.

use std::sync::Arc;

use candle_core::{Error, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use parking_lot::{Condvar, Mutex};

const BN_EPS: f64 = 1e-5;

// ── Modes ───────────────────────────────────────────────────────────────────

/// Where a normalisation layer takes its statistics from.
#[derive(Clone, Default)]
pub enum NormMode {
    /// The layer's own input.
    #[default]
    Local,
    /// The union of all replicas in a [`StatsGroup`].
    Synced(SyncLink),
}

/// Membership of one replica in a [`StatsGroup`].
#[derive(Clone)]
pub struct SyncLink {
    group: Arc<StatsGroup>,
    rank: usize,
}

impl SyncLink {
    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// Per-channel first and second moments of one replica's activations.
#[derive(Clone)]
pub struct Moments {
    sum: Tensor,
    sum_sq: Tensor,
    count: usize,
}

// ── StatsGroup ──────────────────────────────────────────────────────────────

/// Rendezvous point of `size` replicas exchanging [`Moments`].
///
/// Every normalisation layer call is one round: each replica deposits its
/// moments and blocks until all replicas have deposited theirs. Replicas run
/// the same layer sequence, so round `n` always refers to the same layer.
pub struct StatsGroup {
    size: usize,
    state: Mutex<Rendezvous>,
    round_done: Condvar,
}

struct Rendezvous {
    generation: u64,
    arrived: usize,
    pending: Vec<Option<Moments>>,
    /// Moments of the last completed round. Only replaced when the next
    /// round completes, which needs every replica to have read this one.
    completed: Arc<Vec<Moments>>,
    aborted: bool,
}

impl StatsGroup {
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            size,
            state: Mutex::new(Rendezvous {
                generation: 0,
                arrived: 0,
                pending: vec![None; size],
                completed: Arc::new(Vec::new()),
                aborted: false,
            }),
            round_done: Condvar::new(),
        })
    }

    /// One link per rank, in rank order.
    pub fn links(self: &Arc<Self>) -> Vec<SyncLink> {
        (0..self.size)
            .map(|rank| SyncLink {
                group: Arc::clone(self),
                rank,
            })
            .collect()
    }

    /// Release every waiting replica with an error. Called when one replica
    /// fails so the others never wait for it.
    ///
    /// Returns `true` for the call that aborted the group, `false` once it was
    /// already aborted.
    pub fn abort(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.aborted;
        state.aborted = true;
        self.round_done.notify_all();
        first
    }

    fn all_reduce(&self, rank: usize, local: Moments) -> Result<Moments> {
        let device = local.sum.device().clone();
        let round = {
            let mut state = self.state.lock();
            if state.aborted {
                return Err(Error::Msg("statistics group aborted".into()));
            }
            let generation = state.generation;
            state.pending[rank] = Some(local);
            state.arrived += 1;
            if state.arrived == self.size {
                let round: Vec<Moments> = state.pending.iter_mut().filter_map(Option::take).collect();
                state.completed = Arc::new(round);
                state.arrived = 0;
                state.generation += 1;
                self.round_done.notify_all();
            } else {
                while state.generation == generation && !state.aborted {
                    self.round_done.wait(&mut state);
                }
                if state.generation == generation {
                    return Err(Error::Msg("statistics group aborted".into()));
                }
            }
            Arc::clone(&state.completed)
        };

        // Reduce in rank order so every replica computes identical totals.
        let mut sum = round[0].sum.to_device(&device)?;
        let mut sum_sq = round[0].sum_sq.to_device(&device)?;
        let mut count = round[0].count;
        for m in &round[1..] {
            sum = sum.add(&m.sum.to_device(&device)?)?;
            sum_sq = sum_sq.add(&m.sum_sq.to_device(&device)?)?;
            count += m.count;
        }
        Ok(Moments { sum, sum_sq, count })
    }
}

// ── BatchNorm2d ─────────────────────────────────────────────────────────────

/// Batch normalisation over `(B, C, H, W)` with a learnable affine transform.
///
/// Always normalises with batch statistics; the crate has no inference path,
/// so no running averages are kept.
pub struct BatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    mode: NormMode,
}

impl BatchNorm2d {
    pub fn new(channels: usize, mode: NormMode, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, mode })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;
        let local = Moments {
            sum: channel_sum(x)?,
            sum_sq: channel_sum(&x.sqr()?)?,
            count: b * h * w,
        };
        let total = match &self.mode {
            NormMode::Local => local,
            NormMode::Synced(link) => link.group.all_reduce(link.rank, local)?,
        };

        let n = total.count as f64;
        let mean = total.sum.affine(1.0 / n, 0.0)?;
        let var = total.sum_sq.affine(1.0 / n, 0.0)?.sub(&mean.sqr()?)?.relu()?;
        let std = var.affine(1.0, BN_EPS)?.sqrt()?;
        let normed = x.broadcast_sub(&mean)?.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.weight.reshape((1, c, 1, 1))?)?
            .broadcast_add(&self.bias.reshape((1, c, 1, 1))?)
    }
}

/// Per-channel sum over batch and spatial axes, shaped `(1, C, 1, 1)`.
fn channel_sum(x: &Tensor) -> Result<Tensor> {
    x.sum_keepdim(0)?.sum_keepdim(2)?.sum_keepdim(3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn input(b: usize) -> Tensor {
        let n = b * 2 * 3 * 3;
        let data: Vec<f32> = (0..n).map(|i| ((i * 7) % 11) as f32 * 0.3 - 1.0).collect();
        Tensor::from_vec(data, (b, 2, 3, 3), &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn local_output_is_standardised() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bn = BatchNorm2d::new(2, NormMode::Local, vb).unwrap();
        let y = bn.forward(&input(4)).unwrap();
        let mean = y.mean_all().unwrap().to_scalar::<f32>().unwrap();
        let var = y.sqr().unwrap().mean_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn synced_shards_match_full_batch() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let full = BatchNorm2d::new(2, NormMode::Local, vb.clone())
            .unwrap()
            .forward(&input(5))
            .unwrap();

        let group = StatsGroup::new(2);
        let x = input(5);
        let shards = [(0, 3), (3, 2)];
        let outputs: Vec<Tensor> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .links()
                .into_iter()
                .zip(shards)
                .map(|(link, (start, len))| {
                    let vb = vb.clone();
                    let shard = x.narrow(0, start, len).unwrap();
                    s.spawn(move || {
                        let bn = BatchNorm2d::new(2, NormMode::Synced(link), vb).unwrap();
                        bn.forward(&shard).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let joined = Tensor::cat(&outputs, 0).unwrap();
        for (a, b) in values(&full).iter().zip(values(&joined)) {
            assert!((a - b).abs() < 1e-4, "{a} vs {b}");
        }
    }

    #[test]
    fn abort_releases_waiting_replicas() {
        let group = StatsGroup::new(2);
        let link = group.links().remove(0);
        let waiter = {
            let group = Arc::clone(&group);
            std::thread::spawn(move || {
                let x = input(1);
                let m = Moments {
                    sum: channel_sum(&x).unwrap(),
                    sum_sq: channel_sum(&x).unwrap(),
                    count: 9,
                };
                group.all_reduce(link.rank(), m)
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(group.abort());
        assert!(!group.abort());
        assert!(waiter.join().unwrap().is_err());
    }
}
