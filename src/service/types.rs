//! Service layer types

use serde::{Deserialize, Serialize};

use crate::geometry::MaskPayload;
use crate::types::{Detection, EyePair, FaceMesh};

/// How much of the face pipeline to run after detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Boxes and keypoints only
    Fast,
    /// Plus the 468-point mesh
    Standard,
    /// Plus irises
    #[default]
    Full,
}

impl DetectionMode {
    pub fn wants_mesh(&self) -> bool {
        matches!(self, DetectionMode::Standard | DetectionMode::Full)
    }

    pub fn wants_iris(&self) -> bool {
        matches!(self, DetectionMode::Full)
    }
}

/// One detected face with whatever the mode asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub detection: Detection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh: Option<FaceMesh>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eyes: Option<EyePair>,
}

impl Face {
    pub fn new(detection: Detection) -> Self {
        Self {
            detection,
            mesh: None,
            eyes: None,
        }
    }
}

/// Result of a parallel detect + segment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedResult {
    pub faces: Vec<Face>,
    pub mask: MaskPayload,
    pub detection_ms: f64,
    pub segmentation_ms: f64,
    /// The two operations overlap, so this is the larger of the two
    pub total_ms: f64,
}
