//! BlazeFace Face Detector
//!
//! Short/full-range SSD face detection. Outputs normalized bounding boxes and
//! 6 keypoints per face (eyes, nose tip, mouth, ear tragions).

use std::sync::Arc;

use ndarray::Array4;
use tracing::{debug, info};

use super::pool::{output_slice, run_tensor, ModelPool, ModelType};
use super::preprocess::{input_tensor, letterbox_into, Frame, Normalization};
use crate::error::Result;
use crate::geometry::transform::remove_letterbox;
use crate::geometry::{
    decode_detections, generate_anchors, non_max_suppression, DecoderOptions, DetectionModel,
    NmsOptions,
};
use crate::types::Detection;

/// Output index of the box/keypoint regressors
const REGRESSOR_OUTPUT: usize = 0;

/// Output index of the score logits
const SCORE_OUTPUT: usize = 1;

/// BlazeFace Face Detector
pub struct FaceDetector {
    pool: Arc<ModelPool>,
    model: DetectionModel,
    anchors: Vec<f32>,
    decoder: DecoderOptions,
    nms: NmsOptions,
    input: Option<Array4<f32>>,
}

impl FaceDetector {
    /// Create a new face detector; anchors are generated once here
    pub fn new(pool: Arc<ModelPool>, model: DetectionModel, nms: NmsOptions) -> Result<Self> {
        let anchors = generate_anchors(&model.anchor_options())?;
        let side = model.input_size();
        debug!("{} detector: {} anchors", model.as_str(), anchors.len() / 2);

        Ok(Self {
            pool,
            model,
            anchors,
            decoder: DecoderOptions::for_input(side, side),
            nms,
            input: None,
        })
    }

    pub fn model(&self) -> DetectionModel {
        self.model
    }

    pub fn nms_options(&self) -> &NmsOptions {
        &self.nms
    }

    /// Detect faces in a frame
    ///
    /// Returned detections are in original-image normalized coordinates and
    /// carry the frame size.
    pub async fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let side = self.model.input_size();
        let mut input = input_tensor(self.input.take(), side);
        let padding = letterbox_into(frame, side, Normalization::SignedUnit, &mut input)?;

        let model = self.pool.get_model(ModelType::FaceDetection)?;
        let (outputs, input) = run_tensor(&model, input).await?;
        self.input = Some(input);

        let num_anchors = self.anchors.len() / 2;
        let boxes = output_slice(
            &outputs,
            REGRESSOR_OUTPUT,
            Some(num_anchors * self.decoder.values_per_anchor()),
            "detector regressors",
        )?;
        let scores = output_slice(&outputs, SCORE_OUTPUT, Some(num_anchors), "detector scores")?;

        let raw = decode_detections(scores, boxes, &self.anchors, &self.decoder)?;
        let candidates = raw.len();
        let kept = non_max_suppression(raw, &self.nms);

        let size = frame.size();
        let detections: Vec<Detection> = remove_letterbox(&kept, &padding, true)
            .into_iter()
            .map(|d| d.with_image_size(size))
            .collect();

        info!(
            "Detected {} faces ({} anchors, {}x{} input)",
            detections.len(),
            candidates,
            size.width,
            size.height
        );
        Ok(detections)
    }
}
