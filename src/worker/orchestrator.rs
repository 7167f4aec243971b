//! Worker Orchestrator
//!
//! Owns the detection worker and, when enabled, the segmentation worker.
//! Every public call is a message round trip through the matching router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{Config, WorkersConfig};
use crate::engine::{EngineFactory, FaceEmbedding, ModelAssets, ModelType};
use crate::error::{FaceError, Result};
use crate::geometry::MaskPayload;
use crate::service::types::{CombinedResult, DetectionMode, Face};
use crate::types::Detection;

use super::context::{await_ready, detection_init, segmentation_init, WorkerContext, WorkerInit};
use super::protocol::{DetectParams, EmbeddingParams, EmbeddingsParams, Op, PixelParams, SegmentParams};
use super::router::RouterHandle;

/// How long teardown waits for a worker thread to exit
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimeouts {
    pub detection: Duration,
    pub segmentation: Duration,
}

impl From<&WorkersConfig> for HandshakeTimeouts {
    fn from(config: &WorkersConfig) -> Self {
        Self {
            detection: Duration::from_millis(config.detection_handshake_ms),
            segmentation: Duration::from_millis(config.segmentation_handshake_ms),
        }
    }
}

/// A started worker: its router plus the thread behind it
struct WorkerChannel {
    router: RouterHandle,
    context: Mutex<Option<WorkerContext>>,
}

impl WorkerChannel {
    async fn start(name: &str, init: WorkerInit, timeout: Duration) -> Result<Self> {
        let (context, mut channels) = WorkerContext::spawn(name, init)?;

        match tokio::time::timeout(timeout, await_ready(&mut channels.from_worker)).await {
            Ok(Ok(())) => {
                let router = RouterHandle::spawn(name, channels.to_worker, channels.from_worker);
                Ok(Self {
                    router,
                    context: Mutex::new(Some(context)),
                })
            }
            Ok(Err(err)) => {
                error!("Worker {} failed to start: {}", name, err);
                drop(channels);
                context.terminate(TERMINATE_GRACE).await;
                Err(err)
            }
            Err(_) => {
                let ms = timeout.as_millis() as u64;
                error!("Worker {} handshake timed out after {}ms", name, ms);
                // Setup may still be running; the thread exits on its own
                // once it sees the closed request channel.
                drop(channels);
                context.detach();
                Err(FaceError::HandshakeTimeout(ms))
            }
        }
    }

    async fn request<T: DeserializeOwned>(&self, op: Op, params: impl Serialize) -> Result<T> {
        let params = serde_json::to_value(params)
            .map_err(|e| FaceError::invalid(format!("failed to encode {} params: {}", op.as_str(), e)))?;
        let value = self.router.request(op, params).await?;
        serde_json::from_value(value).map_err(|e| {
            FaceError::Worker(format!("unexpected {} result from {}: {}", op.as_str(), self.router.name(), e))
        })
    }

    async fn shutdown(&self) {
        self.router.shutdown().await;
        let context = self.context.lock().take();
        if let Some(context) = context {
            context.terminate(TERMINATE_GRACE).await;
        }
    }
}

/// Caller-side owner of the worker contexts
pub struct WorkerOrchestrator {
    detection: Mutex<Option<Arc<WorkerChannel>>>,
    segmentation: Mutex<Option<Arc<WorkerChannel>>>,
    disposed: AtomicBool,
}

impl WorkerOrchestrator {
    /// Start the workers and wait for their handshakes
    ///
    /// Both workers start concurrently. If either fails, the other is torn
    /// down and the failure is returned.
    pub async fn start(
        timeouts: HandshakeTimeouts,
        detection: WorkerInit,
        segmentation: Option<WorkerInit>,
    ) -> Result<Self> {
        let start = Instant::now();
        let (detection, segmentation) = tokio::join!(
            WorkerChannel::start("detection", detection, timeouts.detection),
            async {
                match segmentation {
                    Some(init) => WorkerChannel::start("segmentation", init, timeouts.segmentation)
                        .await
                        .map(Some),
                    None => Ok(None),
                }
            }
        );

        match (detection, segmentation) {
            (Ok(detection), Ok(segmentation)) => {
                info!(
                    "Workers ready in {}ms (segmentation: {})",
                    start.elapsed().as_millis(),
                    if segmentation.is_some() { "on" } else { "off" }
                );
                Ok(Self {
                    detection: Mutex::new(Some(Arc::new(detection))),
                    segmentation: Mutex::new(segmentation.map(Arc::new)),
                    disposed: AtomicBool::new(false),
                })
            }
            (Err(err), segmentation) => {
                if let Ok(Some(channel)) = segmentation {
                    channel.shutdown().await;
                }
                Err(err)
            }
            (Ok(detection), Err(err)) => {
                detection.shutdown().await;
                Err(err)
            }
        }
    }

    /// Start workers from configuration and model bytes
    ///
    /// The segmentation model bytes go to the segmentation worker only. With
    /// segmentation enabled but no model supplied, the worker is skipped and
    /// segmentation calls fail with `NotInitialized`.
    pub async fn from_config(
        config: &Config,
        factory: Arc<dyn EngineFactory>,
        mut assets: ModelAssets,
    ) -> Result<Self> {
        let segmentation_assets = assets.split_off(&[ModelType::Segmentation]);

        let segmentation = if !config.segmentation.enabled {
            None
        } else if !segmentation_assets.contains(ModelType::Segmentation) {
            warn!("Segmentation enabled but no segmentation model supplied; skipping worker");
            None
        } else {
            Some(segmentation_init(
                config.segmentation.clone(),
                config.inference.clone(),
                factory.clone(),
                segmentation_assets,
            ))
        };

        let detection = detection_init(config.clone(), factory, assets);
        Self::start(HandshakeTimeouts::from(&config.workers), detection, segmentation).await
    }

    fn detection(&self) -> Result<Arc<WorkerChannel>> {
        if self.is_disposed() {
            return Err(FaceError::Disposed);
        }
        self.detection
            .lock()
            .clone()
            .ok_or_else(|| FaceError::NotInitialized("detection worker".into()))
    }

    fn segmentation(&self) -> Result<Arc<WorkerChannel>> {
        if self.is_disposed() {
            return Err(FaceError::Disposed);
        }
        self.segmentation
            .lock()
            .clone()
            .ok_or_else(|| FaceError::NotInitialized("segmentation worker".into()))
    }

    pub fn has_segmentation(&self) -> bool {
        self.segmentation.lock().is_some()
    }

    pub async fn detect(&self, image: &[u8], mode: Option<DetectionMode>) -> Result<Vec<Face>> {
        let params = DetectParams {
            image: image.to_vec(),
            mode,
        };
        self.detection()?.request(Op::Detect, params).await
    }

    pub async fn detect_from_pixels(
        &self,
        width: u32,
        height: u32,
        pixels: &[u8],
        mode: Option<DetectionMode>,
    ) -> Result<Vec<Face>> {
        let params = PixelParams {
            width,
            height,
            pixels: pixels.to_vec(),
            mode,
        };
        self.detection()?.request(Op::DetectFromPixels, params).await
    }

    pub async fn embedding(&self, image: &[u8], detection: Detection) -> Result<FaceEmbedding> {
        let params = EmbeddingParams {
            image: image.to_vec(),
            detection,
        };
        self.detection()?.request(Op::Embedding, params).await
    }

    pub async fn embeddings(&self, image: &[u8], detections: Vec<Detection>) -> Result<Vec<FaceEmbedding>> {
        let params = EmbeddingsParams {
            image: image.to_vec(),
            detections,
        };
        self.detection()?.request(Op::Embeddings, params).await
    }

    pub async fn segment(&self, image: &[u8]) -> Result<MaskPayload> {
        let params = SegmentParams { image: image.to_vec() };
        self.segmentation()?.request(Op::Segment, params).await
    }

    pub async fn segment_from_pixels(&self, width: u32, height: u32, pixels: &[u8]) -> Result<MaskPayload> {
        let params = PixelParams {
            width,
            height,
            pixels: pixels.to_vec(),
            mode: None,
        };
        self.segmentation()?.request(Op::SegmentFromPixels, params).await
    }

    /// Detect and segment the same image on both workers at once
    pub async fn detect_and_segment(&self, image: &[u8], mode: Option<DetectionMode>) -> Result<CombinedResult> {
        let detection = self.detection()?;
        let segmentation = self.segmentation()?;

        let timed = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;
        let (faces, mask) = tokio::join!(
            async {
                let start = Instant::now();
                let params = DetectParams {
                    image: image.to_vec(),
                    mode,
                };
                let faces: Result<Vec<Face>> = detection.request(Op::Detect, params).await;
                faces.map(|faces| (faces, timed(start)))
            },
            async {
                let start = Instant::now();
                let params = SegmentParams { image: image.to_vec() };
                let mask: Result<MaskPayload> = segmentation.request(Op::Segment, params).await;
                mask.map(|mask| (mask, timed(start)))
            }
        );
        let (faces, detection_ms) = faces?;
        let (mask, segmentation_ms) = mask?;

        Ok(CombinedResult {
            faces,
            mask,
            detection_ms,
            segmentation_ms,
            total_ms: detection_ms.max(segmentation_ms),
        })
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Fail pending requests, release worker resources and stop the threads
    ///
    /// Calling this more than once is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing workers");

        let detection = self.detection.lock().take();
        let segmentation = self.segmentation.lock().take();
        tokio::join!(
            async {
                if let Some(channel) = detection {
                    channel.shutdown().await;
                }
            },
            async {
                if let Some(channel) = segmentation {
                    channel.shutdown().await;
                }
            }
        );
        info!("Workers disposed");
    }
}
