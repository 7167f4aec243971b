//! Coordinate transforms between model space and image space
//!
//! Covers letterbox removal, region-of-interest computation for the
//! secondary models (mesh, iris, embedding), and mapping crop-local landmark
//! outputs back into absolute image pixels.

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};
use crate::types::{AlignedRoi, Detection, FaceKeypoint, FaceMesh, ImageSize, NormalizedRect, Point};

/// Default ROI growth around a detection box
pub const DEFAULT_ROI_EXPANSION: f32 = 0.6;

/// Embedding crop edge as a multiple of the eye distance
pub const EMBEDDING_SIZE_MULTIPLIER: f32 = 2.5;

/// Shift of the embedding crop center from the eye midpoint toward the
/// mouth, as a fraction of the eye distance
pub const EMBEDDING_CENTER_SHIFT: f32 = 0.2;

/// Mesh crop edge as a multiple of the eye distance
pub const FACE_EYE_SCALE: f32 = 4.0;

/// Mesh crop edge as a multiple of the eye-midpoint-to-mouth distance
pub const FACE_MOUTH_SCALE: f32 = 3.6;

/// Blend factor from the eye midpoint toward the mouth for the mesh crop center
pub const FACE_CENTER_BLEND: f32 = 0.4;

/// Iris crop edge as a multiple of the eye-corner distance
pub const EYE_ROI_SCALE: f32 = 2.3;

/// Mesh indices of the subject's right eye corners (outer, inner)
pub const RIGHT_EYE_CORNERS: (usize, usize) = (33, 133);

/// Mesh indices of the subject's left eye corners (inner, outer)
pub const LEFT_EYE_CORNERS: (usize, usize) = (362, 263);

/// Letterbox margins as fractions of the padded square
///
/// Each opposing pair (`top + bottom`, `left + right`) lies in `[0, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "[f32; 4]", into = "[f32; 4]")]
pub struct Padding {
    top: f32,
    bottom: f32,
    left: f32,
    right: f32,
}

impl Padding {
    pub fn new(top: f32, bottom: f32, left: f32, right: f32) -> Result<Self> {
        let valid = |v: f32| v.is_finite() && v >= 0.0;
        if !(valid(top) && valid(bottom) && valid(left) && valid(right)) {
            return Err(FaceError::invalid(format!(
                "padding values must be finite and non-negative: [{top}, {bottom}, {left}, {right}]"
            )));
        }
        if top + bottom >= 1.0 || left + right >= 1.0 {
            return Err(FaceError::invalid(format!(
                "padding pairs must sum below 1: [{top}, {bottom}, {left}, {right}]"
            )));
        }
        Ok(Self { top, bottom, left, right })
    }

    /// No padding
    pub fn none() -> Self {
        Self::default()
    }

    /// Padding produced by centering an image of `size` in a square
    pub fn letterbox(size: ImageSize) -> Self {
        let (w, h) = (size.width_f32(), size.height_f32());
        if w <= 0.0 || h <= 0.0 {
            return Self::none();
        }
        if w >= h {
            let pad = (1.0 - h / w) / 2.0;
            Self { top: pad, bottom: pad, left: 0.0, right: 0.0 }
        } else {
            let pad = (1.0 - w / h) / 2.0;
            Self { top: 0.0, bottom: 0.0, left: pad, right: pad }
        }
    }

    /// Padding from integer pixel margins inside a `side x side` square
    pub fn from_pixels(side: u32, top: u32, bottom: u32, left: u32, right: u32) -> Result<Self> {
        let s = side as f32;
        Self::new(top as f32 / s, bottom as f32 / s, left as f32 / s, right as f32 / s)
    }

    pub fn top(&self) -> f32 {
        self.top
    }

    pub fn bottom(&self) -> f32 {
        self.bottom
    }

    pub fn left(&self) -> f32 {
        self.left
    }

    pub fn right(&self) -> f32 {
        self.right
    }

    /// `[top, bottom, left, right]`
    pub fn as_array(&self) -> [f32; 4] {
        [self.top, self.bottom, self.left, self.right]
    }

    pub fn is_none(&self) -> bool {
        self.as_array().iter().all(|&v| v == 0.0)
    }

    /// Map a padded-space x back to original-image space
    pub fn unpad_x(&self, x: f32) -> f32 {
        unpad_value(x, self.left, self.right)
    }

    /// Map a padded-space y back to original-image space
    pub fn unpad_y(&self, y: f32) -> f32 {
        unpad_value(y, self.top, self.bottom)
    }

    /// Map an original-image x into padded space
    pub fn pad_x(&self, x: f32) -> f32 {
        x * (1.0 - self.left - self.right) + self.left
    }

    /// Map an original-image y into padded space
    pub fn pad_y(&self, y: f32) -> f32 {
        y * (1.0 - self.top - self.bottom) + self.top
    }
}

impl TryFrom<[f32; 4]> for Padding {
    type Error = FaceError;

    fn try_from(v: [f32; 4]) -> Result<Self> {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Padding> for [f32; 4] {
    fn from(p: Padding) -> Self {
        p.as_array()
    }
}

/// `(v - low) / (1 - low - high)`
#[inline]
pub fn unpad_value(v: f32, low: f32, high: f32) -> f32 {
    (v - low) / (1.0 - low - high)
}

/// Remove letterbox padding from detections
///
/// Box corners and keypoints are mapped identically; scores pass through.
/// With `clamp == false` coordinates may leave `[0, 1]`, which callers use to
/// spot out-of-frame landmarks.
pub fn remove_letterbox(detections: &[Detection], padding: &Padding, clamp: bool) -> Vec<Detection> {
    let fix = |v: f32| if clamp { v.clamp(0.0, 1.0) } else { v };

    detections
        .iter()
        .map(|d| {
            let rect = NormalizedRect::new(
                fix(padding.unpad_x(d.rect.xmin)),
                fix(padding.unpad_y(d.rect.ymin)),
                fix(padding.unpad_x(d.rect.xmax)),
                fix(padding.unpad_y(d.rect.ymax)),
            );
            let keypoints = d
                .keypoints
                .chunks_exact(2)
                .flat_map(|kp| [fix(padding.unpad_x(kp[0])), fix(padding.unpad_y(kp[1]))])
                .collect();
            Detection {
                rect,
                score: d.score,
                keypoints,
                image_size: d.image_size,
            }
        })
        .collect()
}

/// Square ROI around a detection box
///
/// The box grows by `expansion` around its center, then both sides take the
/// larger of the expanded width and height.
pub fn roi_from_rect(rect: &NormalizedRect, expansion: f32) -> NormalizedRect {
    let expanded = rect.expand(expansion);
    let side = expanded.width().max(expanded.height());
    let (cx, cy) = expanded.center();
    NormalizedRect::from_center(cx, cy, side, side)
}

/// Rotated square crop aligned on two eye points (pixel space)
///
/// `left` and `right` are the eyes as they appear left-to-right in the
/// image. The center moves from the eye midpoint along the perpendicular of
/// the eye line, toward where the mouth is expected.
pub fn align_from_eyes(left: Point, right: Point, size_multiplier: f32, center_shift: f32) -> AlignedRoi {
    let dx = right.x - left.x;
    let dy = right.y - left.y;
    let distance = (dx * dx + dy * dy).sqrt();
    let theta = dy.atan2(dx);

    let mid = left.midpoint(&right);
    let (ux, uy) = if distance > 0.0 {
        (dx / distance, dy / distance)
    } else {
        (1.0, 0.0)
    };
    // Perpendicular pointing down the face (image y grows downward).
    let (px, py) = (-uy, ux);

    AlignedRoi::new(
        mid.x + px * distance * center_shift,
        mid.y + py * distance * center_shift,
        distance * size_multiplier,
        theta,
    )
}

/// Crop alignment for the embedding model
pub fn embedding_alignment(left: Point, right: Point) -> AlignedRoi {
    align_from_eyes(left, right, EMBEDDING_SIZE_MULTIPLIER, EMBEDDING_CENTER_SHIFT)
}

/// Embedding crop alignment from a detection's eye keypoints
pub fn embedding_alignment_for(detection: &Detection) -> Result<AlignedRoi> {
    let image_left = detection.keypoint_px(FaceKeypoint::RightEye)?;
    let image_right = detection.keypoint_px(FaceKeypoint::LeftEye)?;
    Ok(embedding_alignment(image_left, image_right))
}

/// Crop alignment for the face-mesh model from a full detection
///
/// Size combines eye distance and eye-to-mouth distance so that both frontal
/// and strongly tilted faces fit; the center blends the eye midpoint toward
/// the mouth. Requires the detection's image size.
pub fn face_alignment(detection: &Detection) -> Result<AlignedRoi> {
    let image_left = detection.keypoint_px(FaceKeypoint::RightEye)?;
    let image_right = detection.keypoint_px(FaceKeypoint::LeftEye)?;
    let mouth = detection.keypoint_px(FaceKeypoint::Mouth)?;

    let eyes = image_left.midpoint(&image_right);
    let eye_distance = image_left.distance(&image_right);
    let eye_mouth = eyes.distance(&mouth);

    let size = (eye_distance * FACE_EYE_SCALE).max(eye_mouth * FACE_MOUTH_SCALE);
    let cx = eyes.x + (mouth.x - eyes.x) * FACE_CENTER_BLEND;
    let cy = eyes.y + (mouth.y - eyes.y) * FACE_CENTER_BLEND;
    let theta = (image_right.y - image_left.y).atan2(image_right.x - image_left.x);

    Ok(AlignedRoi::new(cx, cy, size, theta))
}

/// Which of the subject's eyes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeSide {
    Left,
    Right,
}

impl EyeSide {
    /// The iris model sees left eyes; right-eye crops are mirrored.
    pub fn is_mirrored(&self) -> bool {
        matches!(self, EyeSide::Right)
    }
}

/// Square iris crop around one eye's mesh corners
pub fn eye_roi_from_mesh(mesh: &FaceMesh, side: EyeSide) -> AlignedRoi {
    let (a, b) = match side {
        EyeSide::Right => RIGHT_EYE_CORNERS,
        EyeSide::Left => LEFT_EYE_CORNERS,
    };
    // Indices are below the fixed mesh size.
    let p0 = mesh.points()[a];
    let p1 = mesh.points()[b];
    let center = p0.midpoint(&p1);
    let theta = (p1.y - p0.y).atan2(p1.x - p0.x);
    AlignedRoi::new(center.x, center.y, p0.distance(&p1) * EYE_ROI_SCALE, theta)
}

/// Map one crop-normalized point into absolute pixels
///
/// A mirrored crop has its x reflected (`1 - x`) before rotation, undoing
/// the flip applied to the crop.
pub fn crop_to_absolute(point: &Point, roi: &AlignedRoi, mirrored: bool) -> Point {
    let x = if mirrored { 1.0 - point.x } else { point.x };
    let dx = (x - 0.5) * roi.size;
    let dy = (point.y - 0.5) * roi.size;
    let (sin, cos) = roi.theta.sin_cos();

    let ax = roi.cx + dx * cos - dy * sin;
    let ay = roi.cy + dx * sin + dy * cos;

    match point.z {
        Some(z) => Point::new_3d(ax, ay, z * roi.size),
        None => Point::new(ax, ay),
    }
}

/// Map normalized iris landmarks local to an eye crop into source pixels
pub fn iris_to_absolute(points: &[Point], roi: &AlignedRoi, mirrored: bool) -> Vec<Point> {
    points.iter().map(|p| crop_to_absolute(p, roi, mirrored)).collect()
}

/// Unpack a flat landmark tensor into absolute points
///
/// `raw` holds `dims` (2 or 3) floats per point in crop-input pixels of an
/// `input_size x input_size` model input.
pub fn unpack_landmarks(
    raw: &[f32],
    dims: usize,
    input_size: f32,
    roi: &AlignedRoi,
    mirrored: bool,
) -> Result<Vec<Point>> {
    if !(dims == 2 || dims == 3) {
        return Err(FaceError::invalid(format!("landmark dims must be 2 or 3, got {dims}")));
    }
    if raw.len() % dims != 0 {
        return Err(FaceError::shape(format!(
            "landmark tensor length {} is not a multiple of {}",
            raw.len(),
            dims
        )));
    }
    if input_size <= 0.0 {
        return Err(FaceError::invalid("landmark input size must be positive"));
    }

    Ok(raw
        .chunks_exact(dims)
        .map(|c| {
            let local = if dims == 3 {
                Point::new_3d(c[0] / input_size, c[1] / input_size, c[2] / input_size)
            } else {
                Point::new(c[0] / input_size, c[1] / input_size)
            };
            crop_to_absolute(&local, roi, mirrored)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FACE_MESH_POINTS;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_padding_validation() {
        assert!(Padding::new(0.5, 0.5, 0.0, 0.0).is_err());
        assert!(Padding::new(-0.1, 0.0, 0.0, 0.0).is_err());
        assert!(Padding::new(0.2, 0.2, 0.1, 0.3).is_ok());
        assert!(Padding::try_from([0.0, 0.0, 0.6, 0.6]).is_err());
    }

    #[test]
    fn test_padding_json_is_validated() {
        assert!(serde_json::from_str::<Padding>("[0.6, 0.5, 0.0, 0.0]").is_err());
        assert!(serde_json::from_str::<Padding>("[0.1, 0.2]").is_err());

        let padding: Padding = serde_json::from_str("[0.1, 0.2, 0.0, 0.3]").unwrap();
        assert_eq!(padding.top(), 0.1);
        assert_eq!(padding.bottom(), 0.2);
        assert_eq!(padding.right(), 0.3);
        assert_eq!(serde_json::to_string(&padding).unwrap(), "[0.1,0.2,0.0,0.3]");
    }

    #[test]
    fn test_symmetric_padding_preserves_center() {
        let padding = Padding::new(0.0, 0.0, 0.25, 0.25).unwrap();
        assert!((padding.unpad_x(0.5) - 0.5).abs() < 1e-6);
        assert!((padding.unpad_x(0.25)).abs() < 1e-6);
        assert!((padding.unpad_x(0.75) - 1.0).abs() < 1e-6);
        assert!((padding.pad_x(padding.unpad_x(0.6)) - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_from_size() {
        let wide = Padding::letterbox(ImageSize::new(200, 100));
        assert_eq!(wide.as_array(), [0.25, 0.25, 0.0, 0.0]);
        let tall = Padding::letterbox(ImageSize::new(100, 400));
        assert_eq!(tall.as_array(), [0.0, 0.0, 0.375, 0.375]);
    }

    #[test]
    fn test_remove_letterbox_clamps_unless_asked() {
        let padding = Padding::new(0.25, 0.25, 0.0, 0.0).unwrap();
        let det = Detection::new(NormalizedRect::new(0.1, 0.1, 0.5, 0.5), 0.7, vec![0.3, 0.2]);

        let clamped = remove_letterbox(std::slice::from_ref(&det), &padding, true);
        assert_eq!(clamped[0].rect.ymin, 0.0);
        assert!((clamped[0].rect.ymax - 0.5).abs() < 1e-6);
        assert_eq!(clamped[0].keypoints[1], 0.0);
        assert_eq!(clamped[0].score, 0.7);

        let raw = remove_letterbox(&[det], &padding, false);
        assert!((raw[0].rect.ymin + 0.3).abs() < 1e-6);
        assert!((raw[0].keypoints[1] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_roi_from_rect_is_square() {
        let rect = NormalizedRect::new(0.4, 0.4, 0.5, 0.6);
        let roi = roi_from_rect(&rect, DEFAULT_ROI_EXPANSION);
        assert!((roi.width() - roi.height()).abs() < 1e-6);
        assert!((roi.height() - 0.32).abs() < 1e-6);
        let (cx, cy) = roi.center();
        assert!((cx - 0.45).abs() < 1e-6 && (cy - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_alignment_level_eyes() {
        let roi = embedding_alignment(Point::new(40.0, 50.0), Point::new(80.0, 50.0));
        assert!(roi.theta.abs() < 1e-6);
        assert!((roi.size - 100.0).abs() < 1e-4);
        assert!((roi.cx - 60.0).abs() < 1e-4);
        // Shifted down toward the mouth.
        assert!((roi.cy - 58.0).abs() < 1e-4);
    }

    #[test]
    fn test_embedding_alignment_rotated_eyes() {
        let roi = embedding_alignment(Point::new(50.0, 40.0), Point::new(50.0, 80.0));
        assert!((roi.theta - FRAC_PI_2).abs() < 1e-6);
        // Perpendicular of a downward eye line points to -x.
        assert!((roi.cx - 42.0).abs() < 1e-4);
        assert!((roi.cy - 60.0).abs() < 1e-4);
    }

    #[test]
    fn test_face_alignment_needs_image_size() {
        let kps = vec![0.4, 0.4, 0.6, 0.4, 0.5, 0.5, 0.5, 0.6, 0.3, 0.45, 0.7, 0.45];
        let det = Detection::new(NormalizedRect::new(0.3, 0.3, 0.7, 0.7), 0.9, kps);
        assert!(face_alignment(&det).is_err());

        let det = det.with_image_size(ImageSize::new(100, 100));
        let roi = face_alignment(&det).unwrap();
        assert!(roi.theta.abs() < 1e-6);
        // eye distance 20 -> 80; eye-mouth 20 -> 72
        assert!((roi.size - 80.0).abs() < 1e-3);
        assert!((roi.cx - 50.0).abs() < 1e-4);
        assert!((roi.cy - 48.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_to_absolute_identity() {
        let roi = AlignedRoi::new(100.0, 50.0, 20.0, 0.0);
        let p = crop_to_absolute(&Point::new(0.5, 0.5), &roi, false);
        assert_eq!(p, Point::new(100.0, 50.0));
        let corner = crop_to_absolute(&Point::new(0.0, 0.0), &roi, false);
        assert!((corner.x - 90.0).abs() < 1e-5 && (corner.y - 40.0).abs() < 1e-5);
    }

    #[test]
    fn test_iris_mirror_reflects_before_rotation() {
        let roi = AlignedRoi::new(0.0, 0.0, 10.0, FRAC_PI_2);
        let points = [Point::new(1.0, 0.5)];
        let plain = iris_to_absolute(&points, &roi, false);
        let mirrored = iris_to_absolute(&points, &roi, true);
        // +x in crop maps to +y after a quarter turn; mirrored flips to -y.
        assert!(plain[0].x.abs() < 1e-5 && (plain[0].y - 5.0).abs() < 1e-5);
        assert!(mirrored[0].x.abs() < 1e-5 && (mirrored[0].y + 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_unpack_landmarks() {
        let roi = AlignedRoi::new(32.0, 32.0, 64.0, 0.0);
        let raw = [0.0, 0.0, 1.0, 192.0, 192.0, -3.0];
        let points = unpack_landmarks(&raw, 3, 192.0, &roi, false).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points[0].x.abs() < 1e-4 && points[0].y.abs() < 1e-4);
        assert!((points[1].x - 64.0).abs() < 1e-4);
        assert!((points[1].z.unwrap() + 1.0).abs() < 1e-4);

        assert!(unpack_landmarks(&raw[..5], 3, 192.0, &roi, false).is_err());
        assert!(unpack_landmarks(&raw, 4, 192.0, &roi, false).is_err());
    }

    #[test]
    fn test_eye_roi_from_mesh() {
        let mut points = vec![Point::new(0.0, 0.0); FACE_MESH_POINTS];
        points[33] = Point::new(10.0, 20.0);
        points[133] = Point::new(30.0, 20.0);
        points[362] = Point::new(50.0, 20.0);
        points[263] = Point::new(70.0, 20.0);
        let mesh = FaceMesh::new(points).unwrap();

        let right = eye_roi_from_mesh(&mesh, EyeSide::Right);
        assert!((right.cx - 20.0).abs() < 1e-5);
        assert!((right.size - 46.0).abs() < 1e-4);
        let left = eye_roi_from_mesh(&mesh, EyeSide::Left);
        assert!((left.cx - 60.0).abs() < 1e-5);
        assert!(EyeSide::Right.is_mirrored() && !EyeSide::Left.is_mirrored());
    }
}
