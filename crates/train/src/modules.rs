//! The three trainable modules and the parameter registry over them.
//!
//! Each module owns its parameters in its own `VarMap`. The [`ParameterSet`]
//! is built once from those maps and is the single list of trainable tensors
//! the optimizer and the checkpoint store iterate over.

use std::collections::{HashMap, HashSet};

use animator_common::{AnimatorConfig, Error, ModelParams, Result, TrainParams};
use animator_core::{ModuleBuilders, NormMode, ReconstructionModel};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

/// Identifies one of the trainable modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModuleKind {
    Generator,
    RegionPredictor,
    BgPredictor,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [Self::Generator, Self::RegionPredictor, Self::BgPredictor];

    /// Name prefix of the module's parameters in checkpoints.
    pub fn name(self) -> &'static str {
        match self {
            Self::Generator => "generator",
            Self::RegionPredictor => "region_predictor",
            Self::BgPredictor => "bg_predictor",
        }
    }
}

// ── ModuleSet ───────────────────────────────────────────────────────────────

/// Parameter storage of the three modules plus the live model reading it.
pub struct ModuleSet {
    generator: VarMap,
    region_predictor: VarMap,
    bg_predictor: VarMap,
    model: ReconstructionModel,
    model_params: ModelParams,
    train_params: TrainParams,
    device: Device,
}

impl ModuleSet {
    /// Build freshly initialised modules on `device`.
    pub fn new(config: &AnimatorConfig, device: &Device) -> Result<Self> {
        let generator = VarMap::new();
        let region_predictor = VarMap::new();
        let bg_predictor = VarMap::new();
        let builders = ModuleBuilders {
            region_predictor: VarBuilder::from_varmap(&region_predictor, DType::F32, device),
            bg_predictor: VarBuilder::from_varmap(&bg_predictor, DType::F32, device),
            generator: VarBuilder::from_varmap(&generator, DType::F32, device),
        };
        let model = ReconstructionModel::new(
            &config.model_params,
            &config.train_params,
            builders,
            NormMode::Local,
        )?;
        Ok(Self {
            generator,
            region_predictor,
            bg_predictor,
            model,
            model_params: config.model_params.clone(),
            train_params: config.train_params.clone(),
            device: device.clone(),
        })
    }

    pub fn varmap(&self, kind: ModuleKind) -> &VarMap {
        match kind {
            ModuleKind::Generator => &self.generator,
            ModuleKind::RegionPredictor => &self.region_predictor,
            ModuleKind::BgPredictor => &self.bg_predictor,
        }
    }

    /// The model over the live parameters, local normalisation statistics.
    pub fn model(&self) -> &ReconstructionModel {
        &self.model
    }

    /// Coordinating device: where the parameters live.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// A model on `device` reading the live parameters through device copies.
    ///
    /// The copies stay on the autograd graph, so gradients computed on the
    /// replica accumulate onto the live parameters.
    pub fn replica(
        &self,
        parameters: &ParameterSet,
        device: &Device,
        mode: NormMode,
    ) -> Result<ReconstructionModel> {
        let view = |kind| -> Result<VarBuilder<'static>> {
            let tensors = parameters.module_tensors(kind, device)?;
            Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
        };
        let builders = ModuleBuilders {
            region_predictor: view(ModuleKind::RegionPredictor)?,
            bg_predictor: view(ModuleKind::BgPredictor)?,
            generator: view(ModuleKind::Generator)?,
        };
        Ok(ReconstructionModel::new(
            &self.model_params,
            &self.train_params,
            builders,
            mode,
        )?)
    }
}

// ── ParameterSet ────────────────────────────────────────────────────────────

/// One trainable tensor.
#[derive(Clone)]
pub struct Parameter {
    /// `<module>.<path>`, unique across the set.
    pub name: String,
    pub module: ModuleKind,
    /// Path inside the module's `VarMap`.
    pub local_name: String,
    pub var: Var,
}

/// Every trainable tensor of the three modules, sorted by name.
///
/// Built once after the modules are constructed; validated complete (each
/// module contributes parameters) and non-overlapping (no tensor is reachable
/// from two modules).
pub struct ParameterSet {
    params: Vec<Parameter>,
}

impl ParameterSet {
    pub fn collect(modules: &ModuleSet) -> Result<Self> {
        let mut params = Vec::new();
        let mut ids = HashSet::new();
        for kind in ModuleKind::ALL {
            let data = modules
                .varmap(kind)
                .data()
                .lock()
                .map_err(|_| Error::ContractViolation("parameter map lock poisoned".into()))?;
            if data.is_empty() {
                return Err(Error::ContractViolation(format!(
                    "module {} has no parameters",
                    kind.name()
                )));
            }
            for (local_name, var) in data.iter() {
                if !ids.insert(var.as_tensor().id()) {
                    return Err(Error::ContractViolation(format!(
                        "parameter {}.{local_name} is shared with another module",
                        kind.name()
                    )));
                }
                params.push(Parameter {
                    name: format!("{}.{local_name}", kind.name()),
                    module: kind,
                    local_name: local_name.clone(),
                    var: var.clone(),
                });
            }
        }
        params.sort_by(|a, b| a.name.cmp(&b.name));
        if params.windows(2).any(|w| w[0].name == w[1].name) {
            return Err(Error::ContractViolation("duplicate parameter names".into()));
        }
        Ok(Self { params })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.params[i])
    }

    /// Total scalar count.
    pub fn num_elements(&self) -> usize {
        self.params.iter().map(|p| p.var.elem_count()).sum()
    }

    /// The module's parameters on `device`, keyed by their local names.
    pub fn module_tensors(&self, kind: ModuleKind, device: &Device) -> Result<HashMap<String, Tensor>> {
        self.params
            .iter()
            .filter(|p| p.module == kind)
            .map(|p| Ok((p.local_name.clone(), p.var.as_tensor().to_device(device)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::tiny_config;

    #[test]
    fn parameter_set_covers_every_module() {
        let modules = ModuleSet::new(&tiny_config(), &Device::Cpu).unwrap();
        let params = ParameterSet::collect(&modules).unwrap();
        assert!(!params.is_empty());
        for kind in ModuleKind::ALL {
            let live = modules.varmap(kind).all_vars().len();
            let listed = params.iter().filter(|p| p.module == kind).count();
            assert_eq!(live, listed, "{kind:?}");
        }
        let names: Vec<_> = params.iter().map(|p| p.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        let first = &names[0];
        assert!(params.get(first).is_some());
        assert!(params.get("generator.nope").is_none());
    }

    #[test]
    fn replica_reads_live_parameters() {
        let modules = ModuleSet::new(&tiny_config(), &Device::Cpu).unwrap();
        let params = ParameterSet::collect(&modules).unwrap();
        let replica = modules.replica(&params, &Device::Cpu, NormMode::Local).unwrap();
        let batch = crate::tests::tiny_batch(2);
        let (live, _) = modules.model().forward(&batch).unwrap();
        let (copy, _) = replica.forward(&batch).unwrap();
        let a = live.total().unwrap().to_scalar::<f32>().unwrap();
        let b = copy.total().unwrap().to_scalar::<f32>().unwrap();
        assert!((a - b).abs() < 1e-6);
    }
}
