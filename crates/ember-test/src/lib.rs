//! Test harness for the Ember engine.
//!
//! Drives [`ember_gpu::GraphicsContext`] over the headless driver so the
//! frame protocol can be exercised without a GPU or a window.

pub mod harness;

pub use harness::{record_clear_pass, FrameHarness, FrameOutcome, HarnessConfig};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] ember_gpu::GpuError),
    #[error("Driver reported protocol violations: {0:?}")]
    Violations(Vec<String>),
}

pub type Result<T> = std::result::Result<T, TestError>;
