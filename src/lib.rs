//! Face Pipeline Library
//!
//! Geometric post-processing for face detection, mesh, iris and
//! segmentation models, and the worker layer that runs those pipelines off
//! the caller's thread.

pub mod config;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod service;
pub mod types;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::{FaceError, Result};
pub use worker::WorkerOrchestrator;
