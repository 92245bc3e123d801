//! Execution environments (backends) for the ASG.
//!
//! Each submodule is a backend able to execute a computation graph.

pub mod backend;
pub mod cpu_backend;

pub use backend::{Backend, ExecutionMode, Memo, RunOutput, RuntimeError};
pub use cpu_backend::CpuBackend;
