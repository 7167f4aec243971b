//! Service layer module

pub mod face_service;
pub mod segmentation_service;
pub mod types;

pub use face_service::FaceService;
pub use segmentation_service::SegmentationService;
pub use types::*;
