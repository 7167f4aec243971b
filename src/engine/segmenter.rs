//! Selfie segmentation stage

use std::sync::Arc;

use ndarray::{Array4, ArrayD};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::pool::{output_slice, run_tensor, ModelPool, ModelType};
use super::preprocess::{input_tensor, letterbox_into, Frame, Normalization};
use crate::error::{FaceError, Result};
use crate::geometry::mask::{decode_binary, decode_multiclass, MULTICLASS_CHANNELS};
use crate::geometry::{MaskFormat, MaskPayload, MulticlassSegmentationMask, SegmentationMask};

/// Segmentation model input edge
pub const SEGMENTER_INPUT_SIZE: u32 = 256;

/// Which segmentation model variant is loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentationModel {
    /// One foreground-probability channel
    #[default]
    Binary,
    /// Six class-logit channels
    Multiclass,
}

impl SegmentationModel {
    pub fn channels(&self) -> usize {
        match self {
            SegmentationModel::Binary => 1,
            SegmentationModel::Multiclass => MULTICLASS_CHANNELS,
        }
    }
}

/// Mask produced by either model variant
#[derive(Debug, Clone, PartialEq)]
pub enum Segmentation {
    Binary(SegmentationMask),
    Multiclass(MulticlassSegmentationMask),
}

impl Segmentation {
    /// Foreground mask, present for both variants
    pub fn mask(&self) -> &SegmentationMask {
        match self {
            Segmentation::Binary(mask) => mask,
            Segmentation::Multiclass(multi) => &multi.mask,
        }
    }

    pub fn to_payload(&self, format: MaskFormat, binary_threshold: f32) -> MaskPayload {
        match self {
            Segmentation::Binary(mask) => mask.to_payload(format, binary_threshold),
            Segmentation::Multiclass(multi) => multi.to_payload(format, binary_threshold),
        }
    }
}

pub struct Segmenter {
    pool: Arc<ModelPool>,
    model: SegmentationModel,
    input: Option<Array4<f32>>,
}

impl Segmenter {
    pub fn new(pool: Arc<ModelPool>, model: SegmentationModel) -> Self {
        Self {
            pool,
            model,
            input: None,
        }
    }

    pub fn model(&self) -> SegmentationModel {
        self.model
    }

    pub async fn segment(&mut self, frame: &Frame) -> Result<Segmentation> {
        let mut input = input_tensor(self.input.take(), SEGMENTER_INPUT_SIZE);
        let padding = letterbox_into(frame, SEGMENTER_INPUT_SIZE, Normalization::Unit, &mut input)?;

        let engine = self.pool.get_model(ModelType::Segmentation)?;
        let (outputs, input) = run_tensor(&engine, input).await?;
        self.input = Some(input);

        let (height, width) = mask_dims(&outputs, self.model.channels())?;
        let data = output_slice(&outputs, 0, Some(width * height * self.model.channels()), "segmentation")?;
        let size = frame.size();
        debug!("Segmentation {}x{} for {}x{} frame", width, height, size.width, size.height);

        Ok(match self.model {
            SegmentationModel::Binary => Segmentation::Binary(decode_binary(
                data,
                width,
                height,
                size.width,
                size.height,
                padding,
            )?),
            SegmentationModel::Multiclass => Segmentation::Multiclass(decode_multiclass(
                data,
                width,
                height,
                size.width,
                size.height,
                padding,
            )?),
        })
    }
}

/// `(height, width)` of the first output, laid out `[1, H, W]` or `[1, H, W, C]`
fn mask_dims(outputs: &[ArrayD<f32>], channels: usize) -> Result<(usize, usize)> {
    let shape = outputs
        .first()
        .ok_or_else(|| FaceError::shape("segmentation model produced no outputs"))?
        .shape();
    match shape {
        [1, h, w] if channels == 1 => Ok((*h, *w)),
        [1, h, w, c] if *c == channels => Ok((*h, *w)),
        other => Err(FaceError::shape(format!(
            "segmentation output shape {:?}, expected [1, H, W, {}]",
            other, channels
        ))),
    }
}
