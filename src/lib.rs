//! # FSFNet: a graph-declared segmentation network in Rust
//!
//! The network is built around an **Abstract Semantic Graph (ASG)**. Layers
//! do not compute anything when called; they append nodes to a graph, which
//! is then checked by shape inference and executed by a backend.
//!
//! ```text
//! FsfNetConfig -> FsfNet::new (declare) -> ShapeInference -> CpuBackend::run
//! ```
//!
//! ## Usage Example
//!
//! ```no_run
//! use fsfnet::{FsfNetConfig, Session};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let config = FsfNetConfig::new(2).with_output_size(56, 56);
//! let mut session = Session::new(config)?;
//!
//! let image = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 224, 224]));
//! let prediction = session.forward(&image)?;
//! assert_eq!(prediction.probabilities.shape(), &[1, 2, 56, 56]);
//! # Ok::<(), fsfnet::Error>(())
//! ```

pub mod analysis;
pub mod asg;
pub mod config;
pub mod error;
pub mod model;
pub mod nn;
pub mod params;
pub mod runtime;
pub mod serialization;
pub mod session;
pub mod tensor;

pub use config::FsfNetConfig;
pub use error::{Error, Result};
pub use model::FsfNet;
pub use params::ParameterStore;
pub use runtime::ExecutionMode;
pub use session::{Prediction, Session};
