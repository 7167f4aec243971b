//! Worker contexts
//!
//! A worker context is a dedicated OS thread running a single-threaded tokio
//! runtime. It owns its own model pool and pipeline and is reachable only
//! through two JSON message channels. The first message it sends is the
//! ready handshake (or the setup error); after that it answers requests in
//! arrival order.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::{Config, InferenceConfig, SegmentationConfig};
use crate::engine::{EngineFactory, ModelAssets, ModelPool, ModelType};
use crate::error::{FaceError, Result};
use crate::service::{FaceService, SegmentationService};

use super::protocol::{
    handshake_failure, parse_handshake, ready_message, DetectParams, EmbeddingParams,
    EmbeddingsParams, Handshake, Op, PixelParams, SegmentParams, WorkerRequest, WorkerResponse,
    UNADDRESSED_ID,
};

/// Request handling inside a worker context
#[async_trait]
pub trait WorkerHandler: Send + 'static {
    /// Answer one request; `Dispose` never reaches the handler
    async fn handle(&mut self, request: WorkerRequest) -> Result<Value>;

    /// Drop models and background tasks
    async fn release(&mut self);
}

/// Builds the handler on the worker thread, inside its runtime
pub type WorkerInit = Box<dyn FnOnce() -> Result<Box<dyn WorkerHandler>> + Send>;

/// Caller-side ends of a worker's message channels
pub struct WorkerChannels {
    pub to_worker: mpsc::UnboundedSender<Value>,
    pub from_worker: mpsc::UnboundedReceiver<Value>,
}

/// Caller-side handle on a running worker thread
pub struct WorkerContext {
    name: String,
    thread: Option<JoinHandle<()>>,
}

impl WorkerContext {
    /// Start a worker thread running `init` and then the request loop
    pub fn spawn(name: &str, init: WorkerInit) -> Result<(Self, WorkerChannels)> {
        let (to_worker, requests) = mpsc::unbounded_channel();
        let (replies, from_worker) = mpsc::unbounded_channel();

        let thread_name = name.to_string();
        let thread = std::thread::Builder::new()
            .name(format!("{}-worker", name))
            .spawn(move || run_worker(thread_name, init, requests, replies))
            .map_err(|e| FaceError::Worker(format!("failed to spawn {} worker: {}", name, e)))?;

        info!("Worker {} started", name);
        Ok((
            Self {
                name: name.to_string(),
                thread: Some(thread),
            },
            WorkerChannels { to_worker, from_worker },
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait up to `grace` for the thread to exit
    ///
    /// The request channel must already be closed or a dispose sent,
    /// otherwise the thread keeps waiting for requests. A thread that does
    /// not exit in time is detached.
    pub async fn terminate(mut self, grace: Duration) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let joined = tokio::time::timeout(grace, tokio::task::spawn_blocking(move || thread.join())).await;
        match joined {
            Ok(Ok(Ok(()))) => info!("Worker {} terminated", self.name),
            Ok(Ok(Err(_))) => error!("Worker {} thread panicked", self.name),
            Ok(Err(e)) => error!("Joining worker {} failed: {}", self.name, e),
            Err(_) => warn!("Worker {} did not exit within {:?}; detaching", self.name, grace),
        }
    }

    /// Leave the thread running on its own
    pub fn detach(mut self) {
        if self.thread.take().is_some() {
            warn!("Worker {} detached", self.name);
        }
    }
}

/// Wait for the worker's handshake message
pub async fn await_ready(from_worker: &mut mpsc::UnboundedReceiver<Value>) -> Result<()> {
    while let Some(message) = from_worker.recv().await {
        match parse_handshake(&message) {
            Some(Handshake::Ready) => return Ok(()),
            Some(Handshake::Failed(err)) => return Err(err),
            None => warn!("Ignoring message before worker handshake: {}", message),
        }
    }
    Err(FaceError::Worker("worker exited before its handshake".into()))
}

fn run_worker(
    name: String,
    init: WorkerInit,
    mut requests: mpsc::UnboundedReceiver<Value>,
    replies: mpsc::UnboundedSender<Value>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let err = FaceError::Worker(format!("failed to build {} runtime: {}", name, e));
            error!("{}", err);
            let _ = replies.send(handshake_failure(&err));
            return;
        }
    };

    runtime.block_on(async move {
        let handler = match init() {
            Ok(handler) => Arc::new(Mutex::new(handler)),
            Err(err) => {
                error!("Worker {} setup failed: {}", name, err);
                let _ = replies.send(handshake_failure(&err));
                return;
            }
        };
        let _ = replies.send(ready_message());
        info!("Worker {} ready", name);

        let mut released = false;
        while let Some(message) = requests.recv().await {
            let id = message.get("id").and_then(Value::as_i64).unwrap_or(UNADDRESSED_ID);
            let request: WorkerRequest = match serde_json::from_value(message) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Worker {} got a malformed request: {}", name, e);
                    let err = FaceError::invalid(format!("malformed request: {}", e));
                    let _ = replies.send(WorkerResponse::err(id, &err).to_value());
                    continue;
                }
            };

            if request.op == Op::Dispose {
                handler.lock().await.release().await;
                released = true;
                let _ = replies.send(WorkerResponse::ok(id, Value::Null).to_value());
                info!("Worker {} released its resources", name);
                break;
            }

            debug!("Worker {} handling {} #{}", name, request.op.as_str(), id);
            // A panic unwinds through the task and drops the guard; the
            // handler stays behind the mutex for the next request.
            let current = handler.clone();
            let task = tokio::spawn(async move { current.lock().await.handle(request).await });

            let response = match task.await {
                Ok(Ok(value)) => WorkerResponse::ok(id, value),
                Ok(Err(err)) => WorkerResponse::err(id, &err),
                Err(e) => {
                    error!("Worker {} handler panicked on request {}: {}", name, id, e);
                    WorkerResponse::err(id, &FaceError::Worker("worker handler panicked".into()))
                }
            };
            let _ = replies.send(response.to_value());
        }

        if !released {
            handler.lock().await.release().await;
        }
        info!("Worker {} stopped", name);
    });
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| FaceError::Worker(format!("failed to encode result: {}", e)))
}

fn unsupported(worker: &str, op: Op) -> FaceError {
    FaceError::invalid(format!("{} worker does not handle {}", worker, op.as_str()))
}

/// Detection pipeline behind the worker boundary
pub struct DetectionWorker {
    service: FaceService,
}

#[async_trait]
impl WorkerHandler for DetectionWorker {
    async fn handle(&mut self, request: WorkerRequest) -> Result<Value> {
        match request.op {
            Op::Detect => {
                let params: DetectParams = request.params()?;
                to_value(self.service.detect(&params.image, params.mode).await?)
            }
            Op::DetectFromPixels => {
                let params: PixelParams = request.params()?;
                let faces = self
                    .service
                    .detect_from_pixels(params.width, params.height, &params.pixels, params.mode)
                    .await?;
                to_value(faces)
            }
            Op::Embedding => {
                let params: EmbeddingParams = request.params()?;
                to_value(self.service.embedding(&params.image, params.detection).await?)
            }
            Op::Embeddings => {
                let params: EmbeddingsParams = request.params()?;
                to_value(self.service.embeddings(&params.image, params.detections).await?)
            }
            op => Err(unsupported("detection", op)),
        }
    }

    async fn release(&mut self) {
        self.service.release();
    }
}

/// Segmentation pipeline behind the worker boundary
pub struct SegmentationWorker {
    service: SegmentationService,
}

#[async_trait]
impl WorkerHandler for SegmentationWorker {
    async fn handle(&mut self, request: WorkerRequest) -> Result<Value> {
        match request.op {
            Op::Segment => {
                let params: SegmentParams = request.params()?;
                to_value(self.service.segment(&params.image).await?)
            }
            Op::SegmentFromPixels => {
                let params: PixelParams = request.params()?;
                let mask = self
                    .service
                    .segment_from_pixels(params.width, params.height, &params.pixels)
                    .await?;
                to_value(mask)
            }
            op => Err(unsupported("segmentation", op)),
        }
    }

    async fn release(&mut self) {
        self.service.release();
    }
}

/// Setup for the detection worker
///
/// The detector is loaded during setup so delegate and model errors fail the
/// handshake instead of the first request.
pub fn detection_init(config: Config, factory: Arc<dyn EngineFactory>, assets: ModelAssets) -> WorkerInit {
    Box::new(move || {
        let pool = Arc::new(ModelPool::new(&config.inference, factory, assets));
        pool.get_model(ModelType::FaceDetection)?;
        tokio::spawn(pool.clone().start_cleanup_task());

        let service = FaceService::new(pool, &config)?;
        Ok(Box::new(DetectionWorker { service }) as Box<dyn WorkerHandler>)
    })
}

/// Setup for the segmentation worker
pub fn segmentation_init(
    config: SegmentationConfig,
    inference: InferenceConfig,
    factory: Arc<dyn EngineFactory>,
    assets: ModelAssets,
) -> WorkerInit {
    Box::new(move || {
        let pool = Arc::new(ModelPool::new(&inference, factory, assets));
        pool.get_model(ModelType::Segmentation)?;
        tokio::spawn(pool.clone().start_cleanup_task());

        let service = SegmentationService::new(pool, &config);
        Ok(Box::new(SegmentationWorker { service }) as Box<dyn WorkerHandler>)
    })
}
