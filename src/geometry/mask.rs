//! Segmentation mask decoding and wire conversion

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};
use crate::geometry::transform::Padding;
use crate::utils::math::softmax_into;

/// Channels in the multiclass segmentation output
pub const MULTICLASS_CHANNELS: usize = 6;

/// Default cut-off for the `binary` wire format
pub const DEFAULT_BINARY_THRESHOLD: f32 = 0.5;

/// Classes of the multiclass segmenter, in channel order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentClass {
    Background = 0,
    Hair = 1,
    BodySkin = 2,
    FaceSkin = 3,
    Clothes = 4,
    Other = 5,
}

/// Wire encoding of mask data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MaskFormat {
    #[default]
    Float32,
    Uint8,
    Binary,
}

/// Per-pixel foreground probability at model resolution
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    pub width: usize,
    pub height: usize,
    pub original_width: u32,
    pub original_height: u32,
    pub padding: Padding,
    data: Vec<f32>,
}

impl SegmentationMask {
    pub fn new(
        width: usize,
        height: usize,
        data: Vec<f32>,
        original_width: u32,
        original_height: u32,
        padding: Padding,
    ) -> Result<Self> {
        let pixels = width.checked_mul(height).ok_or_else(|| {
            FaceError::invalid(format!("mask size {}x{} overflows", width, height))
        })?;
        if data.len() != pixels {
            return Err(FaceError::shape(format!(
                "mask data has {} values, expected {}x{}",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            original_width,
            original_height,
            padding,
            data,
        })
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Probability at a mask pixel
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.data[y * self.width + x])
        } else {
            None
        }
    }

    /// Probability at a normalized point of the original (unpadded) image
    ///
    /// Nearest-neighbour lookup through the letterbox padding.
    pub fn probability_at(&self, x: f32, y: f32) -> Option<f32> {
        if !(0.0..=1.0).contains(&x) || !(0.0..=1.0).contains(&y) {
            return None;
        }
        let (px, py) = self.mask_pixel(x, y);
        self.get(px, py)
    }

    fn mask_pixel(&self, x: f32, y: f32) -> (usize, usize) {
        let mx = self.padding.pad_x(x) * self.width as f32;
        let my = self.padding.pad_y(y) * self.height as f32;
        let px = (mx.floor().max(0.0) as usize).min(self.width.saturating_sub(1));
        let py = (my.floor().max(0.0) as usize).min(self.height.saturating_sub(1));
        (px, py)
    }

    /// Encode for the wire
    pub fn to_payload(&self, format: MaskFormat, binary_threshold: f32) -> MaskPayload {
        MaskPayload {
            width: self.width,
            height: self.height,
            original_width: self.original_width,
            original_height: self.original_height,
            padding: self.padding.as_array(),
            data_format: format,
            data: encode_values(&self.data, format, binary_threshold),
            binary_threshold: (format == MaskFormat::Binary).then_some(binary_threshold),
            class_data: None,
        }
    }

    /// Decode a wire payload; quantized formats come back as `[0, 1]` floats
    pub fn from_payload(payload: &MaskPayload) -> Result<Self> {
        let padding = Padding::try_from(payload.padding)?;
        Self::new(
            payload.width,
            payload.height,
            decode_values(&payload.data, payload.data_format),
            payload.original_width,
            payload.original_height,
            padding,
        )
    }
}

/// Mask with the full 6-class probability buffer retained
#[derive(Debug, Clone, PartialEq)]
pub struct MulticlassSegmentationMask {
    pub mask: SegmentationMask,
    class_data: Vec<f32>,
}

impl MulticlassSegmentationMask {
    /// Probability of `class` at a mask pixel
    pub fn class_probability(&self, class: SegmentClass, x: usize, y: usize) -> Option<f32> {
        if x < self.mask.width && y < self.mask.height {
            let base = (y * self.mask.width + x) * MULTICLASS_CHANNELS;
            Some(self.class_data[base + class as usize])
        } else {
            None
        }
    }

    /// All six class probabilities at a mask pixel
    pub fn classes_at(&self, x: usize, y: usize) -> Option<&[f32]> {
        if x < self.mask.width && y < self.mask.height {
            let base = (y * self.mask.width + x) * MULTICLASS_CHANNELS;
            Some(&self.class_data[base..base + MULTICLASS_CHANNELS])
        } else {
            None
        }
    }

    /// Single-class probability plane
    pub fn class_plane(&self, class: SegmentClass) -> Vec<f32> {
        self.class_data
            .chunks_exact(MULTICLASS_CHANNELS)
            .map(|px| px[class as usize])
            .collect()
    }

    pub fn class_data(&self) -> &[f32] {
        &self.class_data
    }

    /// Decode a wire payload carrying `classData`
    pub fn from_payload(payload: &MaskPayload) -> Result<Self> {
        let class_data = payload
            .class_data
            .as_ref()
            .ok_or_else(|| FaceError::invalid("mask payload has no class data"))?;
        let expected = payload
            .width
            .checked_mul(payload.height)
            .and_then(|pixels| pixels.checked_mul(MULTICLASS_CHANNELS));
        if expected != Some(class_data.len()) {
            return Err(FaceError::shape(format!(
                "class data has {} values, expected {}x{}x{}",
                class_data.len(),
                payload.width,
                payload.height,
                MULTICLASS_CHANNELS
            )));
        }
        Ok(Self {
            mask: SegmentationMask::from_payload(payload)?,
            class_data: class_data.clone(),
        })
    }

    pub fn to_payload(&self, format: MaskFormat, binary_threshold: f32) -> MaskPayload {
        let mut payload = self.mask.to_payload(format, binary_threshold);
        payload.class_data = Some(self.class_data.clone());
        payload
    }
}

/// Mask as exchanged over the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskPayload {
    pub width: usize,
    pub height: usize,
    pub original_width: u32,
    pub original_height: u32,
    pub padding: [f32; 4],
    pub data_format: MaskFormat,
    pub data: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_data: Option<Vec<f32>>,
}

/// Binary model output: values are already probabilities
pub fn decode_binary(
    output: &[f32],
    width: usize,
    height: usize,
    original_width: u32,
    original_height: u32,
    padding: Padding,
) -> Result<SegmentationMask> {
    SegmentationMask::new(width, height, output.to_vec(), original_width, original_height, padding)
}

/// Multiclass model output: 6 logits per pixel, channel-last
///
/// Person probability is `1 - background`.
pub fn decode_multiclass(
    logits: &[f32],
    width: usize,
    height: usize,
    original_width: u32,
    original_height: u32,
    padding: Padding,
) -> Result<MulticlassSegmentationMask> {
    let pixels = width.checked_mul(height).ok_or_else(|| {
        FaceError::invalid(format!("mask size {}x{} overflows", width, height))
    })?;
    if Some(logits.len()) != pixels.checked_mul(MULTICLASS_CHANNELS) {
        return Err(FaceError::shape(format!(
            "multiclass output has {} values, expected {}x{}x{}",
            logits.len(),
            width,
            height,
            MULTICLASS_CHANNELS
        )));
    }

    let mut class_data = vec![0.0; logits.len()];
    let mut person = Vec::with_capacity(pixels);

    for (src, dst) in logits
        .chunks_exact(MULTICLASS_CHANNELS)
        .zip(class_data.chunks_exact_mut(MULTICLASS_CHANNELS))
    {
        softmax_into(src, dst);
        person.push(1.0 - dst[SegmentClass::Background as usize]);
    }

    Ok(MulticlassSegmentationMask {
        mask: SegmentationMask::new(width, height, person, original_width, original_height, padding)?,
        class_data,
    })
}

fn encode_values(data: &[f32], format: MaskFormat, threshold: f32) -> Vec<f32> {
    match format {
        MaskFormat::Float32 => data.to_vec(),
        MaskFormat::Uint8 => data
            .iter()
            .map(|&p| (p.clamp(0.0, 1.0) * 255.0).round())
            .collect(),
        MaskFormat::Binary => data
            .iter()
            .map(|&p| if p >= threshold { 255.0 } else { 0.0 })
            .collect(),
    }
}

fn decode_values(data: &[f32], format: MaskFormat) -> Vec<f32> {
    match format {
        MaskFormat::Float32 => data.to_vec(),
        MaskFormat::Uint8 | MaskFormat::Binary => data.iter().map(|&v| v / 255.0).collect(),
    }
}
