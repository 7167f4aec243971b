//! Geometric post-processing of raw model outputs
//!
//! Pure functions only: anchors, decoding, suppression, coordinate
//! transforms, eye parsing and mask conversion. Nothing here touches the
//! inference engine.

pub mod anchors;
pub mod decoder;
pub mod eyes;
pub mod mask;
pub mod nms;
pub mod transform;

pub use anchors::{generate_anchors, AnchorOptions, DetectionModel};
pub use decoder::{decode_detections, DecoderOptions};
pub use eyes::{parse_eyes, EyeLayout};
pub use mask::{MaskFormat, MaskPayload, MulticlassSegmentationMask, SegmentationMask};
pub use nms::{non_max_suppression, NmsOptions};
pub use transform::{EyeSide, Padding};
