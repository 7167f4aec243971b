//! Face Service - detection pipeline of one worker context
//!
//! Orchestrates detection, mesh, iris and embedding stages over one model
//! pool. Each stage loads its model on first use.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{
    FaceDetector, FaceEmbedder, FaceEmbedding, FaceLandmarker, Frame, IrisLandmarker, ModelPool,
    ModelType,
};
use crate::error::Result;
use crate::types::Detection;

use super::types::{DetectionMode, Face};

/// Face detection service
pub struct FaceService {
    pool: Arc<ModelPool>,
    detector: FaceDetector,
    landmarker: FaceLandmarker,
    iris: IrisLandmarker,
    embedder: FaceEmbedder,
    default_mode: DetectionMode,
}

impl FaceService {
    /// Create a new face service
    ///
    /// The configured default mode is lowered to what the pool has models
    /// for; an explicitly requested mode is never lowered.
    pub fn new(pool: Arc<ModelPool>, config: &Config) -> Result<Self> {
        let detector = FaceDetector::new(pool.clone(), config.detection.model, config.nms_options())?;

        let mut default_mode = config.detection.mode;
        if default_mode.wants_iris() && !pool.has_model(ModelType::Iris) {
            warn!("No iris model; default detection mode lowered to standard");
            default_mode = DetectionMode::Standard;
        }
        if default_mode.wants_mesh() && !pool.has_model(ModelType::FaceMesh) {
            warn!("No face mesh model; default detection mode lowered to fast");
            default_mode = DetectionMode::Fast;
        }

        Ok(Self {
            landmarker: FaceLandmarker::new(pool.clone()),
            iris: IrisLandmarker::new(pool.clone()),
            embedder: FaceEmbedder::new(pool.clone()),
            pool,
            detector,
            default_mode,
        })
    }

    pub fn default_mode(&self) -> DetectionMode {
        self.default_mode
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    /// Detect faces in an encoded image
    pub async fn detect(&mut self, image_data: &[u8], mode: Option<DetectionMode>) -> Result<Vec<Face>> {
        let frame = Frame::decode(image_data)?;
        self.detect_frame(&frame, mode).await
    }

    /// Detect faces in raw RGBA pixels
    pub async fn detect_from_pixels(
        &mut self,
        width: u32,
        height: u32,
        pixels: &[u8],
        mode: Option<DetectionMode>,
    ) -> Result<Vec<Face>> {
        let frame = Frame::from_rgba(width, height, pixels)?;
        self.detect_frame(&frame, mode).await
    }

    pub async fn detect_frame(&mut self, frame: &Frame, mode: Option<DetectionMode>) -> Result<Vec<Face>> {
        let start = Instant::now();
        let mode = mode.unwrap_or(self.default_mode);

        let detections = self.detector.detect(frame).await?;
        let mut faces = Vec::with_capacity(detections.len());

        for detection in detections {
            let mut face = Face::new(detection);
            if mode.wants_mesh() {
                let mesh = self.landmarker.estimate(frame, &face.detection).await?;
                if mode.wants_iris() {
                    face.eyes = self.iris.estimate(frame, &mesh).await?;
                }
                face.mesh = Some(mesh);
            }
            faces.push(face);
        }

        info!(
            "Processed {} faces ({:?}) in {}ms",
            faces.len(),
            mode,
            start.elapsed().as_millis()
        );
        Ok(faces)
    }

    /// Embed one previously detected face
    ///
    /// A detection without an image size is taken to refer to this image.
    pub async fn embedding(&mut self, image_data: &[u8], detection: Detection) -> Result<FaceEmbedding> {
        let frame = Frame::decode(image_data)?;
        let detection = sized_for(detection, &frame);
        self.embedder.embed(&frame, &detection).await
    }

    /// Embed several previously detected faces of one image, in order
    pub async fn embeddings(
        &mut self,
        image_data: &[u8],
        detections: Vec<Detection>,
    ) -> Result<Vec<FaceEmbedding>> {
        let frame = Frame::decode(image_data)?;
        let detections: Vec<Detection> = detections.into_iter().map(|d| sized_for(d, &frame)).collect();
        self.embedder.embed_batch(&frame, &detections).await
    }

    /// Drop every loaded model and stop idle cleanup
    pub fn release(&self) {
        self.pool.release_all();
        self.pool.shutdown();
    }
}

fn sized_for(detection: Detection, frame: &Frame) -> Detection {
    match detection.image_size {
        Some(_) => detection,
        None => detection.with_image_size(frame.size()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::engine::pool::tests::TestFactory;
    use crate::engine::pool::ModelAssets;
    use crate::error::FaceError;
    use crate::geometry::eyes::{EYE_MESH_POINTS, IRIS_POINTS};
    use crate::types::FACE_MESH_POINTS;
    use image::{DynamicImage, RgbImage};
    use ndarray::{ArrayD, IxDyn};
    use std::io::Cursor;

    /// First-layer anchor at grid cell (8, 8) of the short-range model
    const CENTER_ANCHOR: usize = (8 * 16 + 8) * 2;

    /// One face at the center of a 128x128 input with spread-out keypoints
    fn detector_outputs() -> Vec<ArrayD<f32>> {
        let mut boxes = ArrayD::<f32>::zeros(IxDyn(&[1, 896, 16]));
        let mut scores = ArrayD::<f32>::from_elem(IxDyn(&[1, 896, 1]), -10.0);
        let regressors = [
            0.0, 0.0, 40.0, 40.0, // box
            -10.0, -8.0, 10.0, -8.0, // eyes
            0.0, 2.0, 0.0, 12.0, // nose, mouth
            -18.0, -4.0, 18.0, -4.0, // ears
        ];
        for (k, v) in regressors.iter().enumerate() {
            boxes[[0, CENTER_ANCHOR, k]] = *v;
        }
        scores[[0, CENTER_ANCHOR, 0]] = 6.0;
        vec![boxes, scores]
    }

    /// Mesh points spread along a horizontal line through the crop
    fn mesh_outputs() -> Vec<ArrayD<f32>> {
        let raw: Vec<f32> = (0..FACE_MESH_POINTS)
            .flat_map(|i| [40.0 + i as f32 * 0.25, 96.0, 0.0])
            .collect();
        vec![ArrayD::from_shape_vec(IxDyn(&[1, FACE_MESH_POINTS * 3]), raw).unwrap()]
    }

    fn iris_outputs() -> Vec<ArrayD<f32>> {
        let contour: Vec<f32> = (0..EYE_MESH_POINTS).flat_map(|i| [i as f32 * 0.5, 10.0, 0.0]).collect();
        let iris = vec![
            32.0, 32.0, 0.0, 32.0, 28.0, 0.0, 36.0, 32.0, 0.0, 32.0, 36.0, 0.0, 28.0, 32.0, 0.0,
        ];
        vec![
            ArrayD::from_shape_vec(IxDyn(&[1, EYE_MESH_POINTS * 3]), contour).unwrap(),
            ArrayD::from_shape_vec(IxDyn(&[1, IRIS_POINTS * 3]), iris).unwrap(),
        ]
    }

    pub(crate) fn test_factory() -> TestFactory {
        TestFactory::new()
            .with_outputs(ModelType::FaceDetection, detector_outputs())
            .with_outputs(ModelType::FaceMesh, mesh_outputs())
            .with_outputs(ModelType::Iris, iris_outputs())
            .with_outputs(
                ModelType::Embedding,
                vec![ArrayD::from_shape_vec(IxDyn(&[1, 2]), vec![3.0, 4.0]).unwrap()],
            )
    }

    pub(crate) fn all_face_assets() -> ModelAssets {
        ModelAssets::new()
            .with(ModelType::FaceDetection, vec![0u8])
            .with(ModelType::FaceMesh, vec![0u8])
            .with(ModelType::Iris, vec![0u8])
            .with(ModelType::Embedding, vec![0u8])
    }

    pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        bytes
    }

    fn service(assets: ModelAssets) -> FaceService {
        let pool = Arc::new(ModelPool::new(
            &InferenceConfig::default(),
            Arc::new(test_factory()),
            assets,
        ));
        FaceService::new(pool, &Config::default()).unwrap()
    }

    #[tokio::test]
    async fn test_full_mode() {
        let mut service = service(all_face_assets());
        assert_eq!(service.default_mode(), DetectionMode::Full);

        let faces = service.detect(&png(128, 128), None).await.unwrap();
        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        assert_eq!(face.mesh.as_ref().unwrap().points().len(), FACE_MESH_POINTS);
        assert_eq!(face.eyes.as_ref().unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_fast_mode_skips_stages() {
        let mut service = service(all_face_assets());
        let faces = service.detect(&png(128, 128), Some(DetectionMode::Fast)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert!(faces[0].mesh.is_none());
        assert!(!service.pool().is_loaded(ModelType::FaceMesh));
    }

    #[tokio::test]
    async fn test_default_mode_lowered_without_models() {
        let assets = ModelAssets::new().with(ModelType::FaceDetection, vec![0u8]);
        let mut service = service(assets);
        assert_eq!(service.default_mode(), DetectionMode::Fast);

        // Asking explicitly still surfaces the missing model.
        let err = service
            .detect(&png(128, 128), Some(DetectionMode::Standard))
            .await
            .unwrap_err();
        assert!(matches!(err, FaceError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_pixels_and_embeddings() {
        let mut service = service(all_face_assets());
        let pixels = vec![0u8; 128 * 128 * 4];
        let faces = service
            .detect_from_pixels(128, 128, &pixels, Some(DetectionMode::Fast))
            .await
            .unwrap();

        let mut detection = faces[0].detection.clone();
        detection.image_size = None;
        let embedding = service.embedding(&png(128, 128), detection.clone()).await.unwrap();
        assert!((embedding.vector[1] - 0.8).abs() < 1e-6);

        let all = service
            .embeddings(&png(128, 128), vec![detection.clone(), detection])
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_image() {
        let mut service = service(all_face_assets());
        let err = service.detect(b"nope", None).await.unwrap_err();
        assert!(matches!(err, FaceError::ImageDecodeFailed(_)));
        let err = service.detect(&png(8, 8), None).await.unwrap_err();
        assert!(matches!(err, FaceError::ImageTooSmall { .. }));
    }
}
