//! Face mesh stage: 468 3D landmarks from an aligned face crop

use std::sync::Arc;

use ndarray::Array4;
use tracing::debug;

use super::pool::{output_slice, run_tensor, ModelPool, ModelType};
use super::preprocess::{crop_aligned_into, input_tensor, Frame, Normalization};
use crate::error::Result;
use crate::geometry::transform::{face_alignment, unpack_landmarks};
use crate::types::{Detection, FaceMesh, FACE_MESH_POINTS};

/// Face mesh model input edge
pub const MESH_INPUT_SIZE: u32 = 192;

pub struct FaceLandmarker {
    pool: Arc<ModelPool>,
    input: Option<Array4<f32>>,
}

impl FaceLandmarker {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self { pool, input: None }
    }

    /// Estimate the mesh for one detection (which must carry its image size)
    pub async fn estimate(&mut self, frame: &Frame, detection: &Detection) -> Result<FaceMesh> {
        let roi = face_alignment(detection)?;

        let mut input = input_tensor(self.input.take(), MESH_INPUT_SIZE);
        crop_aligned_into(frame, &roi, MESH_INPUT_SIZE, false, Normalization::Unit, &mut input)?;

        let model = self.pool.get_model(ModelType::FaceMesh)?;
        let (outputs, input) = run_tensor(&model, input).await?;
        self.input = Some(input);

        let raw = output_slice(&outputs, 0, Some(FACE_MESH_POINTS * 3), "face mesh landmarks")?;
        let points = unpack_landmarks(raw, 3, MESH_INPUT_SIZE as f32, &roi, false)?;
        debug!("Mesh crop {:.1}px at ({:.1}, {:.1})", roi.size, roi.cx, roi.cy);

        FaceMesh::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::engine::pool::tests::TestFactory;
    use crate::engine::pool::ModelAssets;
    use crate::error::FaceError;
    use crate::types::{ImageSize, NormalizedRect};
    use image::{DynamicImage, RgbImage};
    use ndarray::{ArrayD, IxDyn};

    fn pool(values: usize) -> Arc<ModelPool> {
        // Every landmark at the crop center.
        let mesh = ArrayD::from_elem(IxDyn(&[1, values]), MESH_INPUT_SIZE as f32 / 2.0);
        let factory = TestFactory::new().with_outputs(ModelType::FaceMesh, vec![mesh]);
        Arc::new(ModelPool::new(
            &InferenceConfig::default(),
            Arc::new(factory),
            ModelAssets::new().with(ModelType::FaceMesh, vec![0u8]),
        ))
    }

    fn detection() -> Detection {
        Detection::new(
            NormalizedRect::new(0.3, 0.3, 0.7, 0.7),
            0.9,
            vec![0.4, 0.4, 0.6, 0.4, 0.5, 0.5, 0.5, 0.6, 0.3, 0.45, 0.7, 0.45],
        )
        .with_image_size(ImageSize::new(100, 100))
    }

    fn frame() -> Frame {
        Frame::from_image(DynamicImage::ImageRgb8(RgbImage::new(100, 100))).unwrap()
    }

    #[tokio::test]
    async fn test_mesh_points_land_on_crop_center() {
        let mut landmarker = FaceLandmarker::new(pool(FACE_MESH_POINTS * 3));
        let mesh = landmarker.estimate(&frame(), &detection()).await.unwrap();
        let roi = face_alignment(&detection()).unwrap();

        assert_eq!(mesh.points().len(), FACE_MESH_POINTS);
        let p = mesh.points()[0];
        assert!((p.x - roi.cx).abs() < 1e-3);
        assert!((p.y - roi.cy).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_requires_image_size() {
        let mut landmarker = FaceLandmarker::new(pool(FACE_MESH_POINTS * 3));
        let mut det = detection();
        det.image_size = None;
        let err = landmarker.estimate(&frame(), &det).await.unwrap_err();
        assert!(matches!(err, FaceError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_short_output_rejected() {
        let mut landmarker = FaceLandmarker::new(pool(30));
        let err = landmarker.estimate(&frame(), &detection()).await.unwrap_err();
        assert!(matches!(err, FaceError::UnexpectedTensorShape(_)));
    }
}
