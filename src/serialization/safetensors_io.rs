//! Reading and writing tensors in the SafeTensors format.
//!
//! SafeTensors stores named little-endian tensors behind a JSON header that
//! may also carry free-form string metadata. Only `F32` is written; `F64`
//! files are accepted and narrowed on load.

use ndarray::ArrayD;
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Tensor '{name}' has shape {shape:?} but {len} values")]
    ShapeMismatch {
        name: String,
        shape: Vec<usize>,
        len: usize,
    },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Contents of a SafeTensors file.
#[derive(Debug, Clone, Default)]
pub struct LoadedTensors {
    pub tensors: HashMap<String, ArrayD<f32>>,
    pub metadata: HashMap<String, String>,
}

/// Writes `tensors` as F32, with optional header metadata.
///
/// ```rust,ignore
/// let mut weights = HashMap::new();
/// weights.insert("layer.weight".to_string(), ArrayD::zeros(IxDyn(&[4, 4])));
/// save_safetensors("weights.safetensors", &weights, None)?;
/// ```
pub fn save_safetensors<P: AsRef<Path>>(
    path: P,
    tensors: &HashMap<String, ArrayD<f32>>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    // Byte buffers must outlive the views that borrow them.
    let data_storage: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, arr)| {
            let data: Vec<u8> = arr.iter().flat_map(|&x| x.to_le_bytes()).collect();
            (name.as_str(), arr.shape().to_vec(), data)
        })
        .collect();

    let mut tensor_views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(data_storage.len());
    for (name, shape, data) in &data_storage {
        tensor_views.push((*name, TensorView::new(safetensors::Dtype::F32, shape.clone(), data)?));
    }

    serialize_to_file(tensor_views, &metadata, path.as_ref())?;
    Ok(())
}

fn decode(name: &str, shape: Vec<usize>, floats: Vec<f32>) -> Result<ArrayD<f32>> {
    let len = floats.len();
    ArrayD::from_shape_vec(ndarray::IxDyn(&shape), floats).map_err(|_| SafeTensorsError::ShapeMismatch {
        name: name.to_string(),
        shape,
        len,
    })
}

/// Reads every tensor and the header metadata of a SafeTensors file.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<LoadedTensors> {
    let buffer = fs::read(path)?;

    let (_, header) = SafeTensors::read_metadata(&buffer)?;
    let metadata = header.metadata().clone().unwrap_or_default();

    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut result = HashMap::new();

    for (name, tensor) in tensors.tensors() {
        let shape: Vec<usize> = tensor.shape().to_vec();
        let data = tensor.data();

        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => data
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            safetensors::Dtype::F64 => data
                .chunks_exact(8)
                .map(|chunk| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(chunk);
                    f64::from_le_bytes(bytes) as f32
                })
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };

        result.insert(name.to_string(), decode(&name, shape, floats)?);
    }

    Ok(LoadedTensors { tensors: result, metadata })
}

/// Names of the tensors stored in a SafeTensors file, sorted.
pub fn list_tensors<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;
    let mut names: Vec<String> = tensors.names().iter().map(|s| s.to_string()).collect();
    names.sort();
    Ok(names)
}
