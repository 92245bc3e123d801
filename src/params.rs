//! Concrete values of the parameters and buffers a graph declares.

use crate::asg::{Shape, Value};
use crate::config::FsfNetConfig;
use crate::error::Result;
use crate::serialization::{self, CONFIG_METADATA_KEY};
use crate::tensor::{Init, ParameterSpec};
use log::{info, warn};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("No value for parameter '{0}'")]
    Missing(String),

    #[error("Unknown parameter '{0}'")]
    Unknown(String),

    #[error("Parameter '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Shape,
        actual: Shape,
    },
}

/// Named tensors keyed by their dotted parameter names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    values: BTreeMap<String, ArrayD<f32>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws initial values for `specs` in declaration order from a generator
    /// seeded with `seed`.
    pub fn initialize(specs: &[ParameterSpec], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let values = specs
            .iter()
            .map(|spec| {
                let shape = IxDyn(&spec.shape);
                let value = match spec.init {
                    Init::Zeros => ArrayD::zeros(shape),
                    Init::Ones => ArrayD::ones(shape),
                    Init::Uniform(bound) => {
                        ArrayD::random_using(shape, Uniform::new(-bound, bound), &mut rng)
                    }
                };
                (spec.name.clone(), value)
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.values.get(name)
    }

    /// Inserts or replaces a value, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: ArrayD<f32>) -> Option<ArrayD<f32>> {
        self.values.insert(name.into(), value)
    }

    /// Names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Total number of scalar values.
    pub fn num_elements(&self) -> usize {
        self.values.values().map(|v| v.len()).sum()
    }

    /// Checks that every spec has a value of the declared shape.
    pub fn validate(&self, specs: &[ParameterSpec]) -> std::result::Result<(), ParameterError> {
        for spec in specs {
            let value = self
                .values
                .get(&spec.name)
                .ok_or_else(|| ParameterError::Missing(spec.name.clone()))?;
            if value.shape() != spec.shape.as_slice() {
                return Err(ParameterError::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: value.shape().to_vec(),
                });
            }
        }
        Ok(())
    }

    /// Drops every value no spec declares and returns the dropped names.
    pub fn retain_declared(&mut self, specs: &[ParameterSpec]) -> Vec<String> {
        let dropped: Vec<String> = self
            .values
            .keys()
            .filter(|name| !specs.iter().any(|s| &s.name == *name))
            .cloned()
            .collect();
        for name in &dropped {
            self.values.remove(name);
        }
        dropped
    }

    /// Replaces existing values with `updates`. Every update must name a
    /// known tensor and keep its shape.
    pub fn apply_updates(
        &mut self,
        updates: HashMap<String, Value>,
    ) -> std::result::Result<(), ParameterError> {
        for (name, value) in &updates {
            let current = self
                .values
                .get(name)
                .ok_or_else(|| ParameterError::Unknown(name.clone()))?;
            if current.shape() != value.shape() {
                return Err(ParameterError::ShapeMismatch {
                    name: name.clone(),
                    expected: current.shape().to_vec(),
                    actual: value.shape().to_vec(),
                });
            }
        }
        for (name, value) in updates {
            self.values.insert(name, value.into_tensor());
        }
        Ok(())
    }

    /// Writes every value to a SafeTensors file. The configuration, when
    /// given, is stored as JSON in the file header.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P, config: Option<&FsfNetConfig>) -> Result<()> {
        let metadata = match config {
            Some(config) => Some(HashMap::from([(CONFIG_METADATA_KEY.to_string(), config.to_json_string()?)])),
            None => None,
        };
        let tensors: HashMap<String, ArrayD<f32>> =
            self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        serialization::save_safetensors(path.as_ref(), &tensors, metadata)?;
        info!("saved {} tensors to {}", self.len(), path.as_ref().display());
        Ok(())
    }

    /// Reads a SafeTensors file, returning its values and the configuration
    /// stored in its header, if any.
    pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<(Self, Option<FsfNetConfig>)> {
        let loaded = serialization::load_safetensors(path.as_ref())?;
        let config = match loaded.metadata.get(CONFIG_METADATA_KEY) {
            Some(json) => Some(FsfNetConfig::from_json_str(json)?),
            None => {
                warn!("{} carries no model configuration", path.as_ref().display());
                None
            }
        };
        info!("loaded {} tensors from {}", loaded.tensors.len(), path.as_ref().display());
        Ok((Self { values: loaded.tensors.into_iter().collect() }, config))
    }
}
