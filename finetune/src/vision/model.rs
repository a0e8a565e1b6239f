use shared::Architecture;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tch::vision::{inception, mobilenet, resnet};
use tch::{Device, TchError, Tensor, nn, nn::ModuleT};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),
    #[error("Class count must be positive, got {0}")]
    InvalidClassCount(usize),
    #[error("Pretrained weights for {architecture} not found in {dir}")]
    PretrainedMissing {
        architecture: Architecture,
        dir: PathBuf,
    },
    #[error("Tensor {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },
    #[error("Tensor {0} is missing from the weights")]
    MissingTensor(String),
    #[error("Weights contain unexpected tensor {0}")]
    UnexpectedTensor(String),
    #[error("Torch error: {0}")]
    Tch(#[from] TchError),
}

/// Where the ImageNet classification layer sits in a backbone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadSite {
    /// A single final linear layer, e.g. `fc`.
    Final { layer: &'static str },
    /// A linear layer at a fixed position of a sequential head, e.g. `classifier.1`.
    Indexed { block: &'static str, index: usize },
}

impl HeadSite {
    /// Variable-name prefix of every parameter belonging to the head.
    pub fn prefix(&self) -> String {
        match self {
            HeadSite::Final { layer } => format!("{}.", layer),
            HeadSite::Indexed { block, index } => format!("{}.{}.", block, index),
        }
    }
}

pub struct ArchitectureDescriptor {
    pub architecture: Architecture,
    pub head: HeadSite,
    pub feature_dim: i64,
    pub weights_stem: &'static str,
    build: fn(&nn::Path, i64) -> Box<dyn ModuleT>,
}

fn build_resnet50(p: &nn::Path, num_classes: i64) -> Box<dyn ModuleT> {
    Box::new(resnet::resnet50(p, num_classes))
}

fn build_inception_v3(p: &nn::Path, num_classes: i64) -> Box<dyn ModuleT> {
    Box::new(inception::v3(p, num_classes))
}

fn build_mobilenet_v2(p: &nn::Path, num_classes: i64) -> Box<dyn ModuleT> {
    Box::new(mobilenet::v2(p, num_classes))
}

static DESCRIPTORS: [ArchitectureDescriptor; 3] = [
    ArchitectureDescriptor {
        architecture: Architecture::ResNet50,
        head: HeadSite::Final { layer: "fc" },
        feature_dim: 2048,
        weights_stem: "resnet50",
        build: build_resnet50,
    },
    ArchitectureDescriptor {
        architecture: Architecture::InceptionV3,
        head: HeadSite::Final { layer: "fc" },
        feature_dim: 2048,
        weights_stem: "inception-v3",
        build: build_inception_v3,
    },
    ArchitectureDescriptor {
        architecture: Architecture::MobileNetV2,
        head: HeadSite::Indexed {
            block: "classifier",
            index: 1,
        },
        feature_dim: 1280,
        weights_stem: "mobilenet-v2",
        build: build_mobilenet_v2,
    },
];

pub fn descriptor(architecture: Architecture) -> &'static ArchitectureDescriptor {
    match architecture {
        Architecture::ResNet50 => &DESCRIPTORS[0],
        Architecture::InceptionV3 => &DESCRIPTORS[1],
        Architecture::MobileNetV2 => &DESCRIPTORS[2],
    }
}

pub fn parse_architecture(name: &str) -> Result<Architecture, ModelError> {
    Architecture::from_str(name.trim())
        .map_err(|_| ModelError::UnsupportedArchitecture(name.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelIdentity {
    pub architecture: Architecture,
    pub num_classes: usize,
}

/// A network together with the variable store holding its weights.
pub struct ModelState {
    identity: ModelIdentity,
    vs: nn::VarStore,
    net: Box<dyn ModuleT>,
}

impl ModelState {
    pub fn from_parts(identity: ModelIdentity, vs: nn::VarStore, net: Box<dyn ModuleT>) -> Self {
        Self { identity, vs, net }
    }

    pub fn identity(&self) -> ModelIdentity {
        self.identity
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }

    /// Deep copies of every variable, sorted by name.
    pub fn named_weights(&self) -> Vec<(String, Tensor)> {
        let mut named: Vec<(String, Tensor)> = tch::no_grad(|| {
            self.vs
                .variables()
                .into_iter()
                .map(|(name, tensor)| (name, tensor.detach().copy()))
                .collect()
        });
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    /// Copies `weights` into the store. Every variable must be present with the
    /// exact same shape; nothing is copied unless all of them match.
    pub fn load_named_weights(&mut self, weights: &[(String, Tensor)]) -> Result<(), ModelError> {
        let mut variables = self.vs.variables();
        let provided: HashMap<&str, &Tensor> =
            weights.iter().map(|(name, t)| (name.as_str(), t)).collect();

        for (name, var) in &variables {
            let src = provided
                .get(name.as_str())
                .ok_or_else(|| ModelError::MissingTensor(name.clone()))?;
            if src.size() != var.size() {
                return Err(ModelError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.size(),
                    found: src.size(),
                });
            }
        }
        if let Some((extra, _)) = weights.iter().find(|(name, _)| !variables.contains_key(name)) {
            return Err(ModelError::UnexpectedTensor(extra.clone()));
        }

        tch::no_grad(|| -> Result<(), TchError> {
            for (name, var) in variables.iter_mut() {
                var.f_copy_(provided[name.as_str()])?;
            }
            Ok(())
        })?;
        Ok(())
    }

    fn trainable_count(&self) -> usize {
        self.vs
            .variables()
            .values()
            .filter(|t| t.requires_grad())
            .count()
    }
}

/// Builds backbones from the closed architecture table.
pub struct ModelFactory {
    descriptor: &'static ArchitectureDescriptor,
    device: Device,
}

impl ModelFactory {
    /// Resolves the architecture name before anything else happens, so an
    /// unknown name fails without touching the network or the GPU.
    pub fn new(architecture: &str) -> Result<Self, ModelError> {
        let architecture = parse_architecture(architecture)?;
        Ok(Self::for_architecture(architecture))
    }

    pub fn for_architecture(architecture: Architecture) -> Self {
        Self {
            descriptor: descriptor(architecture),
            device: Device::cuda_if_available(),
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn descriptor(&self) -> &'static ArchitectureDescriptor {
        self.descriptor
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Network with a freshly initialised `num_classes` head and untrained body.
    pub fn skeleton(&self, num_classes: usize) -> Result<ModelState, ModelError> {
        if num_classes == 0 {
            return Err(ModelError::InvalidClassCount(num_classes));
        }
        let vs = nn::VarStore::new(self.device);
        let net = (self.descriptor.build)(&vs.root(), num_classes as i64);
        Ok(ModelState::from_parts(
            ModelIdentity {
                architecture: self.descriptor.architecture,
                num_classes,
            },
            vs,
            net,
        ))
    }

    pub fn pretrained_path(&self, dir: &Path) -> Option<PathBuf> {
        ["ot", "safetensors"]
            .iter()
            .map(|ext| dir.join(format!("{}.{}", self.descriptor.weights_stem, ext)))
            .find(|path| path.exists())
    }

    /// Skeleton with ImageNet weights in the body, the body frozen, and only
    /// the new head left trainable.
    pub fn pretrained(&self, num_classes: usize, dir: &Path) -> Result<ModelState, ModelError> {
        let path = self
            .pretrained_path(dir)
            .ok_or_else(|| ModelError::PretrainedMissing {
                architecture: self.descriptor.architecture,
                dir: dir.to_path_buf(),
            })?;
        let mut state = self.skeleton(num_classes)?;
        let copied = self.load_backbone(&mut state, &path)?;
        log::info!(
            "Loaded {} pretrained tensors for {} from {}",
            copied,
            self.descriptor.architecture,
            path.display()
        );
        self.freeze_body(&state);
        log::info!(
            "Frozen backbone, {} trainable tensors in head {} ({} -> {})",
            state.trainable_count(),
            self.descriptor.head.prefix().trim_end_matches('.'),
            self.descriptor.feature_dim,
            num_classes
        );
        Ok(state)
    }

    fn load_backbone(&self, state: &mut ModelState, path: &Path) -> Result<usize, ModelError> {
        let source = if path.extension().is_some_and(|ext| ext == "safetensors") {
            Tensor::read_safetensors(path)?
        } else {
            Tensor::load_multi(path)?
        };
        let source: HashMap<String, Tensor> = source.into_iter().collect();
        let head_prefix = self.descriptor.head.prefix();

        let mut variables = state.vs.variables();
        let mut copied = 0usize;
        for (name, var) in variables.iter_mut() {
            if name.starts_with(&head_prefix) {
                continue;
            }
            let src = source
                .get(name)
                .ok_or_else(|| ModelError::MissingTensor(name.clone()))?;
            if src.size() != var.size() {
                return Err(ModelError::ShapeMismatch {
                    name: name.clone(),
                    expected: var.size(),
                    found: src.size(),
                });
            }
            tch::no_grad(|| var.f_copy_(src))?;
            copied += 1;
        }
        Ok(copied)
    }

    fn freeze_body(&self, state: &ModelState) {
        let head_prefix = self.descriptor.head.prefix();
        for (name, var) in state.vs.variables() {
            if !name.starts_with(&head_prefix) {
                let _ = var.set_requires_grad(false);
            }
        }
    }
}

/// A single linear layer over flattened `[N, 3, side, side]` input, small
/// enough for CPU tests of the training and persistence paths.
#[cfg(test)]
pub(crate) fn linear_test_model(side: i64, num_classes: usize) -> ModelState {
    use tch::nn::Module;

    let vs = nn::VarStore::new(Device::Cpu);
    let fc = nn::linear(vs.root() / "fc", 3 * side * side, num_classes as i64, Default::default());
    let net = nn::func_t(move |xs, _train| fc.forward(&xs.flatten(1, -1)));
    ModelState::from_parts(
        ModelIdentity {
            architecture: Architecture::ResNet50,
            num_classes,
        },
        vs,
        Box::new(net),
    )
}
