//! Face pipeline configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::engine::segmenter::SegmentationModel;
use crate::engine::ModelAssets;
use crate::engine::ModelType;
use crate::geometry::{DetectionModel, MaskFormat, NmsOptions};
use crate::service::types::DetectionMode;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub segmentation: SegmentationConfig,
    pub inference: InferenceConfig,
    pub workers: WorkersConfig,
    pub models: ModelsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub model: DetectionModel,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub weighted_nms: bool,
    pub mode: DetectionMode,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub enabled: bool,
    pub model: SegmentationModel,
    pub mask_format: MaskFormat,
    pub binary_threshold: f32,
}

/// Hardware delegate requested for the inference engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delegate {
    Cpu,
    Gpu,
    Xnnpack,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub delegate: Delegate,
    pub num_threads: usize,
    /// Seconds a model may sit unused before it is unloaded
    pub model_idle_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub detection_handshake_ms: u64,
    pub segmentation_handshake_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub face_detection: PathBuf,
    pub face_mesh: PathBuf,
    pub iris: PathBuf,
    pub embedding: PathBuf,
    pub segmentation: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    pub fn nms_options(&self) -> NmsOptions {
        NmsOptions {
            iou_threshold: self.detection.iou_threshold,
            score_threshold: self.detection.score_threshold,
            weighted: self.detection.weighted_nms,
        }
    }
}

impl ModelsConfig {
    pub fn path(&self, model: ModelType) -> &Path {
        match model {
            ModelType::FaceDetection => &self.face_detection,
            ModelType::FaceMesh => &self.face_mesh,
            ModelType::Iris => &self.iris,
            ModelType::Embedding => &self.embedding,
            ModelType::Segmentation => &self.segmentation,
        }
    }

    /// Read the bytes of every model file that exists
    ///
    /// Missing optional models are skipped; the pool reports `ModelNotFound`
    /// if one is later requested. The detector itself is required.
    pub fn read_assets(&self) -> anyhow::Result<ModelAssets> {
        let mut assets = ModelAssets::new();
        for model in ModelType::ALL {
            let path = self.path(model);
            if !path.exists() {
                if model == ModelType::FaceDetection {
                    anyhow::bail!("face detection model missing: {}", path.display());
                }
                continue;
            }
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {} model {}", model, path.display()))?;
            assets.insert(model, bytes);
        }
        Ok(assets)
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            model: DetectionModel::ShortRange,
            score_threshold: 0.5,
            iou_threshold: 0.3,
            weighted_nms: true,
            mode: DetectionMode::Full,
        }
    }
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: SegmentationModel::Binary,
            mask_format: MaskFormat::Float32,
            binary_threshold: 0.5,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            delegate: Delegate::Gpu,
            num_threads: 4,
            model_idle_timeout: 300,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            detection_handshake_ms: 30_000,
            segmentation_handshake_ms: 15_000,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            face_detection: PathBuf::from("models/face_detection_short_range.tflite"),
            face_mesh: PathBuf::from("models/face_landmark.tflite"),
            iris: PathBuf::from("models/iris_landmark.tflite"),
            embedding: PathBuf::from("models/mobilefacenet.tflite"),
            segmentation: PathBuf::from("models/selfie_segmenter.tflite"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
