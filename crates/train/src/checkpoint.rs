//! Durable snapshots of the training state.
//!
//! A checkpoint is one safetensors file per epoch tag,
//! `{epoch:08}-checkpoint.safetensors`, holding:
//!
//! | Key | Contents |
//! |-----|----------|
//! | `checkpoint.version` | format version, `i64` |
//! | `checkpoint.epoch` | epoch tag, `i64` |
//! | `<module>.<path>` | every parameter |
//! | `optimizer_reconstruction.exp_avg.<param>` | first moment |
//! | `optimizer_reconstruction.exp_avg_sq.<param>` | second moment |
//! | `optimizer_reconstruction.step.<param>` | update count, `i64` |
//!
//! Files are written to a temporary name, synced and renamed, so a crash
//! never leaves a truncated checkpoint behind. A failed write removes its
//! temporary file. Old checkpoints are kept.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use animator_common::{Error, Result};
use candle_core::{Device, Tensor, Var};

use crate::trainer::TrainingState;

pub const CHECKPOINT_VERSION: i64 = 1;

const VERSION_KEY: &str = "checkpoint.version";
const EPOCH_KEY: &str = "checkpoint.epoch";
const OPTIMIZER_PREFIX: &str = "optimizer_reconstruction";

/// Directory of epoch-tagged checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{epoch:08}-checkpoint.safetensors"))
    }

    pub fn contains(&self, epoch: usize) -> bool {
        self.path_for(epoch).is_file()
    }

    /// Write a checkpoint of `state` tagged `epoch`. Replaces an existing
    /// checkpoint with the same tag.
    pub fn persist(&self, epoch: usize, state: &TrainingState) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let cpu = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(VERSION_KEY.into(), Tensor::new(&[CHECKPOINT_VERSION], &cpu)?);
        tensors.insert(EPOCH_KEY.into(), Tensor::new(&[epoch as i64], &cpu)?);
        for p in state.parameters.iter() {
            tensors.insert(p.name.clone(), p.var.as_tensor().to_device(&cpu)?);
        }
        for (name, m) in state.optimizer.moments() {
            tensors.insert(
                format!("{OPTIMIZER_PREFIX}.exp_avg.{name}"),
                m.exp_avg.as_tensor().to_device(&cpu)?,
            );
            tensors.insert(
                format!("{OPTIMIZER_PREFIX}.exp_avg_sq.{name}"),
                m.exp_avg_sq.as_tensor().to_device(&cpu)?,
            );
            tensors.insert(
                format!("{OPTIMIZER_PREFIX}.step.{name}"),
                Tensor::new(&[m.step as i64], &cpu)?,
            );
        }

        let path = self.path_for(epoch);
        let tmp = self.dir.join(format!(".{epoch:08}-checkpoint.safetensors.tmp"));
        let written = (|| -> Result<()> {
            candle_core::safetensors::save(&tensors, &tmp)?;
            std::fs::File::open(&tmp)?.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        #[cfg(unix)]
        std::fs::File::open(&self.dir)?.sync_all()?;
        tracing::info!(epoch, path = %path.display(), entries = tensors.len(), "checkpoint saved");
        Ok(path)
    }

    /// Load the checkpoint at `path` into `state` and return its epoch tag.
    ///
    /// Every entry is checked against the live state before anything is
    /// written, so a rejected checkpoint leaves `state` untouched.
    pub fn restore(path: &Path, state: &mut TrainingState) -> Result<usize> {
        if !path.is_file() {
            return Err(Error::CheckpointNotFound {
                path: path.to_path_buf(),
            });
        }
        let stored = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| Error::corrupt(path, e.to_string()))?;
        let reader = Reader { path, stored: &stored };

        let version = reader.integer(VERSION_KEY)?;
        if version != CHECKPOINT_VERSION {
            return Err(Error::corrupt(
                path,
                format!("unsupported version {version}, expected {CHECKPOINT_VERSION}"),
            ));
        }
        let epoch = reader.integer(EPOCH_KEY)?;
        let epoch = usize::try_from(epoch)
            .map_err(|_| Error::corrupt(path, format!("negative epoch {epoch}")))?;

        let mut writes: Vec<(Var, Tensor)> = Vec::with_capacity(stored.len());
        for p in state.parameters.iter() {
            writes.push((p.var.clone(), reader.like(&p.name, &p.var)?));
        }
        let mut steps = Vec::with_capacity(state.optimizer.moments().len());
        for (name, m) in state.optimizer.moments() {
            let exp_avg = reader.like(&format!("{OPTIMIZER_PREFIX}.exp_avg.{name}"), &m.exp_avg)?;
            let exp_avg_sq =
                reader.like(&format!("{OPTIMIZER_PREFIX}.exp_avg_sq.{name}"), &m.exp_avg_sq)?;
            let step = reader.integer(&format!("{OPTIMIZER_PREFIX}.step.{name}"))?;
            writes.push((m.exp_avg.clone(), exp_avg));
            writes.push((m.exp_avg_sq.clone(), exp_avg_sq));
            let step = usize::try_from(step)
                .map_err(|_| Error::corrupt(path, format!("negative step count {step} for {name}")))?;
            steps.push((name.clone(), step));
        }
        let expected = 2 + state.parameters.len() + 3 * state.optimizer.moments().len();
        if stored.len() != expected {
            return Err(Error::corrupt(
                path,
                format!("{} entries, expected {expected}", stored.len()),
            ));
        }

        for (var, value) in writes {
            var.set(&value.to_device(var.device())?)?;
        }
        let moments = state.optimizer.moments_mut();
        for (name, step) in steps {
            if let Some(m) = moments.get_mut(&name) {
                m.step = step;
            }
        }
        state.optimizer.sync_step_count();
        state.epoch = epoch;
        tracing::info!(epoch, path = %path.display(), "checkpoint restored");
        Ok(epoch)
    }
}

/// Typed lookups into a loaded checkpoint.
struct Reader<'a> {
    path: &'a Path,
    stored: &'a HashMap<String, Tensor>,
}

impl Reader<'_> {
    fn entry(&self, key: &str) -> Result<&Tensor> {
        self.stored
            .get(key)
            .ok_or_else(|| Error::corrupt(self.path, format!("missing entry {key}")))
    }

    fn integer(&self, key: &str) -> Result<i64> {
        let values = self
            .entry(key)?
            .flatten_all()
            .and_then(|t| t.to_vec1::<i64>())
            .map_err(|e| Error::corrupt(self.path, format!("entry {key}: {e}")))?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::corrupt(self.path, format!("entry {key} is not a scalar"))),
        }
    }

    /// The stored tensor for `key`, checked to match `live` in shape and dtype.
    fn like(&self, key: &str, live: &Tensor) -> Result<Tensor> {
        let stored = self.entry(key)?;
        if stored.shape() != live.shape() || stored.dtype() != live.dtype() {
            return Err(Error::corrupt(
                self.path,
                format!(
                    "entry {key}: stored {:?} {:?}, live {:?} {:?}",
                    stored.dims(),
                    stored.dtype(),
                    live.dims(),
                    live.dtype()
                ),
            ));
        }
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{tiny_batch, tiny_config};
    use crate::trainer::TrainingState;

    fn values(state: &TrainingState) -> Vec<Vec<f32>> {
        let mut out: Vec<Vec<f32>> = state
            .parameters
            .iter()
            .map(|p| p.var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
            .collect();
        for m in state.optimizer.moments().values() {
            out.push(m.exp_avg.as_tensor().flatten_all().unwrap().to_vec1().unwrap());
            out.push(m.exp_avg_sq.as_tensor().flatten_all().unwrap().to_vec1().unwrap());
        }
        out
    }

    fn trained_state() -> TrainingState {
        let mut state = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        let (losses, _) = state.modules.model().forward(&tiny_batch(2)).unwrap();
        let grads = losses.total().unwrap().backward().unwrap();
        state.optimizer.step(&state.parameters, &grads, 1e-2).unwrap();
        state
    }

    #[test]
    fn restore_reproduces_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let state = trained_state();
        let path = store.persist(3, &state).unwrap();
        assert_eq!(path.file_name().unwrap(), "00000003-checkpoint.safetensors");
        assert!(store.contains(3));

        let mut fresh = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        assert_ne!(values(&fresh), values(&state));
        let epoch = CheckpointStore::restore(&path, &mut fresh).unwrap();
        assert_eq!(epoch, 3);
        assert_eq!(fresh.epoch, 3);
        assert_eq!(values(&fresh), values(&state));
        assert_eq!(fresh.optimizer.step_count(), 1);
    }

    #[test]
    fn persisting_twice_gives_equivalent_restores() {
        let state = trained_state();
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let pa = CheckpointStore::new(a.path()).persist(7, &state).unwrap();
        let pb = CheckpointStore::new(b.path()).persist(7, &state).unwrap();
        let mut ra = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        let mut rb = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        assert_eq!(CheckpointStore::restore(&pa, &mut ra).unwrap(), 7);
        assert_eq!(CheckpointStore::restore(&pb, &mut rb).unwrap(), 7);
        assert_eq!(values(&ra), values(&rb));
    }

    #[test]
    fn missing_checkpoint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        let path = dir.path().join("absent.safetensors");
        assert!(matches!(
            CheckpointStore::restore(&path, &mut state),
            Err(Error::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn shape_mismatch_is_corrupt_and_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut other = tiny_config();
        other.model_params.num_regions = 3;
        let foreign = TrainingState::new(&other, &Device::Cpu).unwrap();
        let path = CheckpointStore::new(dir.path()).persist(0, &foreign).unwrap();

        let mut state = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        let before = values(&state);
        assert!(matches!(
            CheckpointStore::restore(&path, &mut state),
            Err(Error::CorruptCheckpoint { .. })
        ));
        assert_eq!(values(&state), before);
        assert_eq!(state.epoch, 0);
    }

    #[test]
    fn garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        std::fs::write(&path, b"not a checkpoint").unwrap();
        let mut state = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        assert!(matches!(
            CheckpointStore::restore(&path, &mut state),
            Err(Error::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn negative_step_count_is_corrupt_and_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = CheckpointStore::new(dir.path()).persist(2, &trained_state()).unwrap();
        let mut stored = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
        let key = stored
            .keys()
            .find(|k| k.starts_with("optimizer_reconstruction.step."))
            .cloned()
            .unwrap();
        stored.insert(key, Tensor::new(&[-1i64], &Device::Cpu).unwrap());
        candle_core::safetensors::save(&stored, &path).unwrap();

        let mut state = TrainingState::new(&tiny_config(), &Device::Cpu).unwrap();
        let before = values(&state);
        assert!(matches!(
            CheckpointStore::restore(&path, &mut state),
            Err(Error::CorruptCheckpoint { .. })
        ));
        assert_eq!(values(&state), before);
        assert_eq!(state.epoch, 0);
        assert_eq!(state.optimizer.step_count(), 0);
    }

    #[test]
    fn failed_write_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let blocker = store.path_for(0);
        std::fs::create_dir_all(blocker.join("occupied")).unwrap();

        assert!(store.persist(0, &trained_state()).is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        assert!(!store.contains(0));
    }
}
