//! Serialization of model weights.
//!
//! Weights are stored as SafeTensors files. The model configuration travels
//! in the file header as JSON, so a weight file fully describes the network
//! it belongs to.
//!
//! ```rust,ignore
//! use fsfnet::serialization::{save_safetensors, load_safetensors};
//!
//! save_safetensors("model.safetensors", &weights, None)?;
//! let loaded = load_safetensors("model.safetensors")?;
//! ```

pub mod safetensors_io;

pub use safetensors_io::{list_tensors, load_safetensors, save_safetensors, LoadedTensors, SafeTensorsError};

/// Header metadata key holding the JSON model configuration.
pub const CONFIG_METADATA_KEY: &str = "fsfnet.config";
