//! Iris stage
//!
//! Each eye is cropped around its mesh corners and run through the shared
//! iris model. The model is trained on one eye orientation, so right-eye
//! crops are mirrored going in and un-mirrored coming out. Whatever point
//! layout the model variant emits is handed to the eye parser.

use std::sync::Arc;

use ndarray::{Array4, ArrayD};
use tracing::debug;

use super::pool::{run_tensor, ModelPool, ModelType};
use super::preprocess::{crop_aligned_into, input_tensor, Frame, Normalization};
use crate::error::{FaceError, Result};
use crate::geometry::eyes::parse_eyes;
use crate::geometry::transform::{eye_roi_from_mesh, unpack_landmarks};
use crate::geometry::EyeSide;
use crate::types::{EyePair, FaceMesh, Point};

/// Iris model input edge
pub const IRIS_INPUT_SIZE: u32 = 64;

pub struct IrisLandmarker {
    pool: Arc<ModelPool>,
    input: Option<Array4<f32>>,
}

impl IrisLandmarker {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self { pool, input: None }
    }

    /// Estimate both eyes from a face mesh
    ///
    /// Returns `None` when the model yields too few points to form an eye.
    pub async fn estimate(&mut self, frame: &Frame, mesh: &FaceMesh) -> Result<Option<EyePair>> {
        let model = self.pool.get_model(ModelType::Iris)?;
        let mut points = Vec::new();

        // Left first: the parser reads the first half as the left eye.
        for side in [EyeSide::Left, EyeSide::Right] {
            let roi = eye_roi_from_mesh(mesh, side);
            let mirrored = side.is_mirrored();

            let mut input = input_tensor(self.input.take(), IRIS_INPUT_SIZE);
            crop_aligned_into(frame, &roi, IRIS_INPUT_SIZE, mirrored, Normalization::Unit, &mut input)?;
            let (outputs, input) = run_tensor(&model, input).await?;
            self.input = Some(input);

            let raw = flatten_outputs(&outputs)?;
            let eye = unpack_landmarks(&raw, 3, IRIS_INPUT_SIZE as f32, &roi, mirrored)?;
            debug!("{:?} eye: {} points", side, eye.len());
            points.extend(eye);
        }

        Ok(parse_eyes(&points))
    }
}

/// Concatenate every output (eye contour first, iris last) into one buffer
fn flatten_outputs(outputs: &[ArrayD<f32>]) -> Result<Vec<f32>> {
    if outputs.is_empty() {
        return Err(FaceError::shape("iris model produced no outputs"));
    }
    let raw: Vec<f32> = outputs.iter().flat_map(|t| t.iter().copied()).collect();
    if raw.len() % 3 != 0 {
        return Err(FaceError::shape(format!(
            "iris outputs hold {} values, not a whole number of 3D points",
            raw.len()
        )));
    }
    Ok(raw)
}

/// Iris centers in pixels, left then right
pub fn iris_centers(eyes: &EyePair) -> Vec<Point> {
    [&eyes.left, &eyes.right]
        .into_iter()
        .flatten()
        .map(|eye| eye.iris_center)
        .collect()
}
