//! Inference engine module
//!
//! Provides the model-backed pipeline stages with:
//! - Model lazy loading and auto-unloading
//! - Delegate fallback to CPU
//! - Single-flight, FIFO access to each engine

pub mod pool;
pub mod serializer;
pub mod preprocess;
pub mod detector;
pub mod mesh;
pub mod iris;
pub mod embedder;
pub mod segmenter;

pub use pool::{EngineFactory, InferenceEngine, ModelAssets, ModelPool, ModelType};
pub use serializer::InferenceSerializer;
pub use preprocess::Frame;
pub use detector::FaceDetector;
pub use mesh::FaceLandmarker;
pub use iris::IrisLandmarker;
pub use embedder::{FaceEmbedder, FaceEmbedding};
pub use segmenter::{Segmentation, SegmentationModel, Segmenter};
