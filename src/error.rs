//! Crate-level error type.

use crate::analysis::ShapeInferenceError;
use crate::asg::AsgError;
use crate::config::ConfigError;
use crate::nn::LayerError;
use crate::params::ParameterError;
use crate::runtime::RuntimeError;
use crate::serialization::SafeTensorsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Asg(#[from] AsgError),

    #[error("Shape inference failed: {0}")]
    ShapeInference(#[from] ShapeInferenceError),

    #[error("Execution failed: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Layer error: {0}")]
    Layer(#[from] LayerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
