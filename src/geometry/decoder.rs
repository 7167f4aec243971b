//! Raw detector output decoding
//!
//! Converts per-anchor score logits and box/keypoint regressions into
//! [`Detection`]s in normalized input coordinates. No filtering happens here;
//! thresholding is the suppressor's job.

use crate::error::{FaceError, Result};
use crate::types::{Detection, NormalizedRect, DETECTION_KEYPOINTS};
use crate::utils::math::{clipped_sigmoid, DEFAULT_SCORE_CLIP};

/// Decoder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderOptions {
    /// Regression offsets are in input pixels and are divided by these
    pub input_width: f32,
    pub input_height: f32,
    pub num_keypoints: usize,
    /// Symmetric clamp on score logits before the sigmoid
    pub score_clip: f32,
}

impl DecoderOptions {
    pub fn for_input(width: u32, height: u32) -> Self {
        Self {
            input_width: width as f32,
            input_height: height as f32,
            num_keypoints: DETECTION_KEYPOINTS,
            score_clip: DEFAULT_SCORE_CLIP,
        }
    }

    /// Floats per anchor in the regression tensor
    pub fn values_per_anchor(&self) -> usize {
        4 + self.num_keypoints * 2
    }
}

/// Decode one detection per anchor
///
/// `scores` holds one logit per anchor, `boxes` holds `values_per_anchor`
/// floats per anchor (`cx, cy, w, h, kx0, ky0, ...`), and `anchors` is the
/// flat `[x, y]*` list from the anchor generator.
pub fn decode_detections(
    scores: &[f32],
    boxes: &[f32],
    anchors: &[f32],
    options: &DecoderOptions,
) -> Result<Vec<Detection>> {
    let num_anchors = anchors.len() / 2;
    let stride = options.values_per_anchor();

    if scores.len() != num_anchors {
        return Err(FaceError::shape(format!(
            "expected {} score values, got {}",
            num_anchors,
            scores.len()
        )));
    }
    if boxes.len() != num_anchors * stride {
        return Err(FaceError::shape(format!(
            "expected {} box values ({} anchors x {}), got {}",
            num_anchors * stride,
            num_anchors,
            stride,
            boxes.len()
        )));
    }

    let sx = options.input_width;
    let sy = options.input_height;

    let detections = anchors
        .chunks_exact(2)
        .zip(boxes.chunks_exact(stride))
        .zip(scores)
        .map(|((anchor, raw), &logit)| {
            let (ax, ay) = (anchor[0], anchor[1]);

            let cx = raw[0] / sx + ax;
            let cy = raw[1] / sy + ay;
            let w = raw[2] / sx;
            let h = raw[3] / sy;

            let keypoints = raw[4..]
                .chunks_exact(2)
                .flat_map(|kp| [kp[0] / sx + ax, kp[1] / sy + ay])
                .collect();

            Detection::new(
                NormalizedRect::from_center(cx, cy, w, h),
                clipped_sigmoid(logit, options.score_clip),
                keypoints,
            )
        })
        .collect();

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DecoderOptions {
        DecoderOptions::for_input(128, 128)
    }

    #[test]
    fn test_decode_offsets_relative_to_anchor() {
        let anchors = [0.25, 0.75];
        let mut boxes = vec![0.0; 16];
        boxes[0] = 12.8; // +0.1 in x
        boxes[1] = -12.8; // -0.1 in y
        boxes[2] = 32.0; // width 0.25
        boxes[3] = 64.0; // height 0.5
        boxes[4] = 6.4; // first keypoint x +0.05

        let dets = decode_detections(&[0.0], &boxes, &anchors, &options()).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.score - 0.5).abs() < 1e-6);
        assert!((d.rect.xmin - (0.35 - 0.125)).abs() < 1e-6);
        assert!((d.rect.ymax - (0.65 + 0.25)).abs() < 1e-6);
        assert_eq!(d.keypoints.len(), 12);
        assert!((d.keypoints[0] - 0.3).abs() < 1e-6);
        assert!((d.keypoints[1] - 0.75).abs() < 1e-6);
        // Untouched keypoints sit on the anchor.
        assert!((d.keypoints[10] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_decode_one_per_anchor() {
        let anchors = vec![0.5; 8];
        let boxes = vec![0.0; 4 * 16];
        let dets = decode_detections(&[-5.0, 0.0, 5.0, 1e9], &boxes, &anchors, &options()).unwrap();
        assert_eq!(dets.len(), 4);
        assert!(dets[0].score < dets[1].score && dets[1].score < dets[2].score);
        assert!(dets[3].score.is_finite());
    }

    #[test]
    fn test_decode_shape_mismatch() {
        let anchors = vec![0.5; 4];
        assert!(matches!(
            decode_detections(&[0.0], &[0.0; 32], &anchors, &options()),
            Err(FaceError::UnexpectedTensorShape(_))
        ));
        assert!(matches!(
            decode_detections(&[0.0, 0.0], &[0.0; 31], &anchors, &options()),
            Err(FaceError::UnexpectedTensorShape(_))
        ));
    }
}
