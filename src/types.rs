//! Geometric data model shared by every pipeline stage
//!
//! All box and keypoint exchange uses normalized `[0, 1]` coordinates relative
//! to a reference image. Pixel coordinates only appear through the
//! `ImageSize`-aware accessors on [`Detection`] and in the aligned-crop types.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};

/// Number of points in a full face mesh
pub const FACE_MESH_POINTS: usize = 468;

/// Number of keypoints emitted per face detection
pub const DETECTION_KEYPOINTS: usize = 6;

/// Dimensions of a reference image in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn width_f32(&self) -> f32 {
        self.width as f32
    }

    pub fn height_f32(&self) -> f32 {
        self.height as f32
    }
}

/// Axis-aligned rectangle in normalized coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

impl NormalizedRect {
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    /// Build from a center point and size
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            xmin: cx - width / 2.0,
            ymin: cy - height / 2.0,
            xmax: cx + width / 2.0,
            ymax: cy + height / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.xmin + self.xmax) / 2.0, (self.ymin + self.ymax) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Multiply every coordinate by the given factors
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            xmin: self.xmin * sx,
            ymin: self.ymin * sy,
            xmax: self.xmax * sx,
            ymax: self.ymax * sy,
        }
    }

    /// Grow the rectangle by `fraction` of its size, keeping the center fixed
    pub fn expand(&self, fraction: f32) -> Self {
        let (cx, cy) = self.center();
        let w = self.width() * (1.0 + fraction);
        let h = self.height() * (1.0 + fraction);
        Self::from_center(cx, cy, w, h)
    }

    /// Intersection over union with another rectangle
    pub fn iou(&self, other: &NormalizedRect) -> f32 {
        let x1 = self.xmin.max(other.xmin);
        let y1 = self.ymin.max(other.ymin);
        let x2 = self.xmax.min(other.xmax);
        let y2 = self.ymax.min(other.ymax);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Named keypoints of a face detection, in model output order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceKeypoint {
    RightEye = 0,
    LeftEye = 1,
    NoseTip = 2,
    Mouth = 3,
    RightEarTragion = 4,
    LeftEarTragion = 5,
}

/// A decoded face detection
///
/// `keypoints` is a flat `[x0, y0, x1, y1, ...]` array in normalized
/// coordinates. `image_size` is only needed to denormalize, and asking for
/// pixel coordinates without it is an error rather than a silent fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub rect: NormalizedRect,
    pub score: f32,
    pub keypoints: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<ImageSize>,
}

impl Detection {
    pub fn new(rect: NormalizedRect, score: f32, keypoints: Vec<f32>) -> Self {
        Self {
            rect,
            score,
            keypoints,
            image_size: None,
        }
    }

    pub fn with_image_size(mut self, size: ImageSize) -> Self {
        self.image_size = Some(size);
        self
    }

    pub fn keypoint_count(&self) -> usize {
        self.keypoints.len() / 2
    }

    /// Normalized keypoint by index
    pub fn keypoint(&self, index: usize) -> Option<Point> {
        let x = *self.keypoints.get(index * 2)?;
        let y = *self.keypoints.get(index * 2 + 1)?;
        Some(Point::new(x, y))
    }

    /// Named keypoint in pixel coordinates
    pub fn keypoint_px(&self, keypoint: FaceKeypoint) -> Result<Point> {
        let size = self.require_image_size()?;
        let p = self.keypoint(keypoint as usize).ok_or_else(|| {
            FaceError::invalid(format!(
                "detection has {} keypoints, {:?} unavailable",
                self.keypoint_count(),
                keypoint
            ))
        })?;
        Ok(Point::new(p.x * size.width_f32(), p.y * size.height_f32()))
    }

    /// All keypoints in pixel coordinates
    pub fn landmarks(&self) -> Result<Vec<Point>> {
        let size = self.require_image_size()?;
        Ok(self
            .keypoints
            .chunks_exact(2)
            .map(|kp| Point::new(kp[0] * size.width_f32(), kp[1] * size.height_f32()))
            .collect())
    }

    /// Bounding box in pixel coordinates
    pub fn rect_px(&self) -> Result<NormalizedRect> {
        let size = self.require_image_size()?;
        Ok(self.rect.scale(size.width_f32(), size.height_f32()))
    }

    fn require_image_size(&self) -> Result<ImageSize> {
        self.image_size
            .ok_or_else(|| FaceError::invalid("detection has no image size; cannot denormalize"))
    }
}

/// A 2D or 3D point
///
/// Equality and hashing cover every present field, so a 2D point never equals
/// a 3D point with the same `x`/`y`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f32>,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: None }
    }

    pub fn new_3d(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z: Some(z) }
    }

    /// Squared euclidean distance in the xy plane
    pub fn distance_sq(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: &Point) -> f32 {
        self.distance_sq(other).sqrt()
    }

    pub fn midpoint(&self, other: &Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

impl PartialEq for Point {
    fn eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits()
            && self.y.to_bits() == other.y.to_bits()
            && self.z.map(f32::to_bits) == other.z.map(f32::to_bits)
    }
}

impl Eq for Point {}

impl Hash for Point {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.x.to_bits().hash(state);
        self.y.to_bits().hash(state);
        self.z.map(f32::to_bits).hash(state);
    }
}

/// A 468-point face mesh in absolute pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Point>", into = "Vec<Point>")]
pub struct FaceMesh {
    points: Vec<Point>,
}

impl FaceMesh {
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if points.len() != FACE_MESH_POINTS {
            return Err(FaceError::invalid(format!(
                "face mesh requires {} points, got {}",
                FACE_MESH_POINTS,
                points.len()
            )));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn point(&self, index: usize) -> Option<&Point> {
        self.points.get(index)
    }
}

impl TryFrom<Vec<Point>> for FaceMesh {
    type Error = FaceError;

    fn try_from(points: Vec<Point>) -> Result<Self> {
        Self::new(points)
    }
}

impl From<FaceMesh> for Vec<Point> {
    fn from(mesh: FaceMesh) -> Self {
        mesh.points
    }
}

/// One eye: iris center, 4-point iris contour and optional eye-region mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eye {
    pub iris_center: Point,
    pub iris_contour: Vec<Point>,
    #[serde(default)]
    pub mesh: Vec<Point>,
}

/// Number of leading mesh points that trace the visible eyelid contour
pub const EYE_CONTOUR_POINTS: usize = 15;

impl Eye {
    /// Eyelid contour: the first 15 mesh points when the mesh is long enough,
    /// otherwise the raw mesh.
    pub fn contour(&self) -> &[Point] {
        if self.mesh.len() >= EYE_CONTOUR_POINTS {
            &self.mesh[..EYE_CONTOUR_POINTS]
        } else {
            &self.mesh
        }
    }

    pub fn has_mesh(&self) -> bool {
        !self.mesh.is_empty()
    }
}

/// Zero, one or two eyes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EyePair {
    pub left: Option<Eye>,
    pub right: Option<Eye>,
}

impl EyePair {
    pub fn count(&self) -> usize {
        usize::from(self.left.is_some()) + usize::from(self.right.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

/// Square rotated region used to drive aligned crops, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignedRoi {
    pub cx: f32,
    pub cy: f32,
    pub size: f32,
    pub theta: f32,
}

impl AlignedRoi {
    pub fn new(cx: f32, cy: f32, size: f32, theta: f32) -> Self {
        Self { cx, cy, size, theta }
    }
}
