//! Model Pool Manager
//!
//! Handles lazy creation of inference engines from in-memory model bytes and
//! automatic unloading after an idle timeout. Each loaded model is wrapped in
//! an [`InferenceSerializer`] so callers never run the same engine twice at
//! once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array4, ArrayD, ArrayViewD};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{Delegate, InferenceConfig};
use crate::engine::serializer::InferenceSerializer;
use crate::error::{FaceError, Result};

/// A loaded model that can run a forward pass
///
/// Implementations are not required to be reentrant; the pool only ever
/// hands them out behind a serializer.
pub trait InferenceEngine: Send + 'static {
    /// Run one forward pass and return the output tensors in model order
    fn run(&mut self, input: ArrayViewD<'_, f32>) -> Result<Vec<ArrayD<f32>>>;
}

/// Creates engines from raw model bytes
pub trait EngineFactory: Send + Sync + 'static {
    fn create(
        &self,
        model: ModelType,
        bytes: &[u8],
        delegate: Delegate,
        num_threads: usize,
    ) -> Result<Box<dyn InferenceEngine>>;
}

/// Serialized handle to a loaded engine
pub type ModelHandle = InferenceSerializer<Box<dyn InferenceEngine>>;

/// Model types that can be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    FaceDetection,
    FaceMesh,
    Iris,
    Embedding,
    Segmentation,
}

impl ModelType {
    pub const ALL: [ModelType; 5] = [
        ModelType::FaceDetection,
        ModelType::FaceMesh,
        ModelType::Iris,
        ModelType::Embedding,
        ModelType::Segmentation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::FaceDetection => "face_detection",
            ModelType::FaceMesh => "face_mesh",
            ModelType::Iris => "iris",
            ModelType::Embedding => "embedding",
            ModelType::Segmentation => "segmentation",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model bytes owned by one worker context
#[derive(Default, Clone)]
pub struct ModelAssets {
    models: HashMap<ModelType, Arc<[u8]>>,
}

impl ModelAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: ModelType, bytes: impl Into<Arc<[u8]>>) {
        self.models.insert(model, bytes.into());
    }

    pub fn with(mut self, model: ModelType, bytes: impl Into<Arc<[u8]>>) -> Self {
        self.insert(model, bytes);
        self
    }

    pub fn get(&self, model: ModelType) -> Option<&Arc<[u8]>> {
        self.models.get(&model)
    }

    pub fn contains(&self, model: ModelType) -> bool {
        self.models.contains_key(&model)
    }

    /// Move the listed models out into a new set
    pub fn split_off(&mut self, models: &[ModelType]) -> ModelAssets {
        let mut out = ModelAssets::new();
        for model in models {
            if let Some(bytes) = self.models.remove(model) {
                out.models.insert(*model, bytes);
            }
        }
        out
    }
}

/// A cached engine with its last access time
struct CachedModel {
    handle: Arc<ModelHandle>,
    last_access: Instant,
}

/// Model Pool Manager with lazy loading and auto-unloading
pub struct ModelPool {
    factory: Arc<dyn EngineFactory>,
    assets: ModelAssets,
    delegate: Delegate,
    num_threads: usize,
    idle_timeout: Duration,

    cache: RwLock<HashMap<ModelType, CachedModel>>,

    // Shutdown signal
    shutdown: Notify,
}

impl ModelPool {
    /// Create a new model pool
    pub fn new(config: &InferenceConfig, factory: Arc<dyn EngineFactory>, assets: ModelAssets) -> Self {
        Self {
            factory,
            assets,
            delegate: config.delegate,
            num_threads: config.num_threads,
            idle_timeout: Duration::from_secs(config.model_idle_timeout),
            cache: RwLock::new(HashMap::new()),
            shutdown: Notify::new(),
        }
    }

    pub fn has_model(&self, model_type: ModelType) -> bool {
        self.assets.contains(model_type)
    }

    /// Get or load a model
    ///
    /// Must be called from within a tokio runtime, since a newly loaded model
    /// starts its serializer task.
    pub fn get_model(&self, model_type: ModelType) -> Result<Arc<ModelHandle>> {
        {
            let mut cache = self.cache.write();
            if let Some(cached) = cache.get_mut(&model_type) {
                cached.last_access = Instant::now();
                return Ok(cached.handle.clone());
            }
        }

        let bytes = self
            .assets
            .get(model_type)
            .ok_or_else(|| FaceError::ModelNotFound(model_type.to_string()))?
            .clone();

        info!("Loading model: {} ({} bytes, {:?})", model_type, bytes.len(), self.delegate);
        let start = Instant::now();
        let engine = self.create_engine(model_type, &bytes)?;
        info!("Model {} loaded in {:?}", model_type, start.elapsed());

        let mut cache = self.cache.write();
        // Another caller may have finished loading while we were busy.
        if let Some(cached) = cache.get_mut(&model_type) {
            cached.last_access = Instant::now();
            return Ok(cached.handle.clone());
        }
        let handle = Arc::new(InferenceSerializer::new(model_type.as_str(), engine));
        cache.insert(
            model_type,
            CachedModel {
                handle: handle.clone(),
                last_access: Instant::now(),
            },
        );
        Ok(handle)
    }

    /// Create with the configured delegate, then once more on plain CPU
    fn create_engine(&self, model_type: ModelType, bytes: &[u8]) -> Result<Box<dyn InferenceEngine>> {
        let first = self
            .factory
            .create(model_type, bytes, self.delegate, self.num_threads);

        match first {
            Ok(engine) => Ok(engine),
            Err(err @ FaceError::ModelNotFound(_)) => Err(err),
            Err(err) if self.delegate == Delegate::Cpu => Err(creation_failed(model_type, err)),
            Err(err) => {
                warn!(
                    "Creating {} with {:?} delegate failed ({}); retrying on CPU",
                    model_type, self.delegate, err
                );
                self.factory
                    .create(model_type, bytes, Delegate::Cpu, self.num_threads)
                    .map_err(|err| match err {
                        FaceError::ModelNotFound(_) => err,
                        other => creation_failed(model_type, other),
                    })
            }
        }
    }

    /// Check if a model is loaded
    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.cache.read().contains_key(&model_type)
    }

    /// Get status of all models this pool has bytes for
    pub fn get_status(&self) -> Vec<(ModelType, bool)> {
        ModelType::ALL
            .iter()
            .filter(|m| self.has_model(**m))
            .map(|m| (*m, self.is_loaded(*m)))
            .collect()
    }

    /// Drop every loaded engine
    ///
    /// Requests already holding a handle finish normally; the engine is
    /// released once the last of them completes.
    pub fn release_all(&self) {
        let mut cache = self.cache.write();
        for model_type in cache.keys() {
            debug!("Releasing model: {}", model_type);
        }
        cache.clear();
    }

    /// Check and unload idle models
    fn cleanup_idle_models(&self) {
        let now = Instant::now();
        let mut cache = self.cache.write();
        cache.retain(|model_type, cached| {
            let idle = now.duration_since(cached.last_access) > self.idle_timeout;
            if idle {
                info!("Unloading idle model: {}", model_type);
            }
            !idle
        });
    }

    /// Start the background cleanup task
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let check_interval = self.idle_timeout.min(Duration::from_secs(60)).max(Duration::from_secs(1));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models();
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Run `input` through a loaded model, handing the tensor back for reuse
pub async fn run_tensor(
    handle: &ModelHandle,
    input: Array4<f32>,
) -> Result<(Vec<ArrayD<f32>>, Array4<f32>)> {
    handle
        .run(move |engine| {
            let outputs = engine.run(input.view().into_dyn())?;
            Ok((outputs, input))
        })
        .await
}

/// Borrow output `index` as a flat slice, checking its length when given
pub fn output_slice<'a>(
    outputs: &'a [ArrayD<f32>],
    index: usize,
    expected_len: Option<usize>,
    what: &str,
) -> Result<&'a [f32]> {
    let tensor = outputs.get(index).ok_or_else(|| {
        FaceError::shape(format!("{}: missing output {} (got {})", what, index, outputs.len()))
    })?;
    let data = tensor
        .as_slice()
        .ok_or_else(|| FaceError::shape(format!("{}: output {} is not contiguous", what, index)))?;
    if let Some(expected) = expected_len {
        if data.len() != expected {
            return Err(FaceError::shape(format!(
                "{}: output {} has {} values, expected {}",
                what,
                index,
                data.len(),
                expected
            )));
        }
    }
    Ok(data)
}

fn creation_failed(model_type: ModelType, err: FaceError) -> FaceError {
    match err {
        FaceError::InterpreterCreationFailed(msg) => {
            FaceError::InterpreterCreationFailed(format!("{}: {}", model_type, msg))
        }
        other => FaceError::InterpreterCreationFailed(format!("{}: {}", model_type, other)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Engine returning fixed outputs, for pipeline tests
    pub(crate) struct FixedEngine {
        pub outputs: Vec<ArrayD<f32>>,
    }

    impl InferenceEngine for FixedEngine {
        fn run(&mut self, _input: ArrayViewD<'_, f32>) -> Result<Vec<ArrayD<f32>>> {
            Ok(self.outputs.clone())
        }
    }

    /// Factory that fails for delegates in `reject` and counts attempts
    pub(crate) struct TestFactory {
        pub reject: Vec<Delegate>,
        pub attempts: AtomicUsize,
        pub outputs: HashMap<ModelType, Vec<ArrayD<f32>>>,
    }

    impl TestFactory {
        pub(crate) fn new() -> Self {
            Self {
                reject: Vec::new(),
                attempts: AtomicUsize::new(0),
                outputs: HashMap::new(),
            }
        }

        pub(crate) fn with_outputs(mut self, model: ModelType, outputs: Vec<ArrayD<f32>>) -> Self {
            self.outputs.insert(model, outputs);
            self
        }
    }

    impl EngineFactory for TestFactory {
        fn create(
            &self,
            model: ModelType,
            _bytes: &[u8],
            delegate: Delegate,
            _num_threads: usize,
        ) -> Result<Box<dyn InferenceEngine>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.reject.contains(&delegate) {
                return Err(FaceError::InterpreterCreationFailed(format!("{:?} unavailable", delegate)));
            }
            Ok(Box::new(FixedEngine {
                outputs: self.outputs.get(&model).cloned().unwrap_or_default(),
            }))
        }
    }

    fn config(delegate: Delegate) -> InferenceConfig {
        InferenceConfig {
            delegate,
            ..InferenceConfig::default()
        }
    }

    fn assets() -> ModelAssets {
        ModelAssets::new().with(ModelType::FaceDetection, vec![1u8, 2, 3])
    }

    #[test]
    fn test_model_type_as_str() {
        assert_eq!(ModelType::FaceDetection.as_str(), "face_detection");
        assert_eq!(ModelType::Segmentation.to_string(), "segmentation");
    }

    #[tokio::test]
    async fn test_lazy_load_and_cache() {
        let factory = Arc::new(TestFactory::new());
        let pool = ModelPool::new(&config(Delegate::Cpu), factory.clone(), assets());

        assert!(!pool.is_loaded(ModelType::FaceDetection));
        let a = pool.get_model(ModelType::FaceDetection).unwrap();
        let b = pool.get_model(ModelType::FaceDetection).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(pool.is_loaded(ModelType::FaceDetection));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get_status(), vec![(ModelType::FaceDetection, true)]);

        pool.release_all();
        assert!(!pool.is_loaded(ModelType::FaceDetection));
    }

    #[tokio::test]
    async fn test_missing_bytes() {
        let pool = ModelPool::new(&config(Delegate::Cpu), Arc::new(TestFactory::new()), assets());
        let err = pool.get_model(ModelType::Iris).err().unwrap();
        assert!(matches!(err, FaceError::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_gpu_failure_retries_on_cpu_once() {
        let mut factory = TestFactory::new();
        factory.reject = vec![Delegate::Gpu];
        let factory = Arc::new(factory);
        let pool = ModelPool::new(&config(Delegate::Gpu), factory.clone(), assets());

        assert!(pool.get_model(ModelType::FaceDetection).is_ok());
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cpu_retry_failure_surfaces() {
        let mut factory = TestFactory::new();
        factory.reject = vec![Delegate::Gpu, Delegate::Cpu];
        let factory = Arc::new(factory);
        let pool = ModelPool::new(&config(Delegate::Gpu), factory.clone(), assets());

        let err = pool.get_model(ModelType::FaceDetection).err().unwrap();
        assert!(matches!(err, FaceError::InterpreterCreationFailed(_)));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idle_models_unloaded() {
        let pool = ModelPool::new(
            &InferenceConfig {
                model_idle_timeout: 0,
                ..InferenceConfig::default()
            },
            Arc::new(TestFactory::new()),
            assets(),
        );
        pool.get_model(ModelType::FaceDetection).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.cleanup_idle_models();
        assert!(!pool.is_loaded(ModelType::FaceDetection));
    }

    #[test]
    fn test_output_slice_checks() {
        let outputs = vec![ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 4]))];
        assert_eq!(output_slice(&outputs, 0, Some(4), "t").unwrap().len(), 4);
        assert!(matches!(
            output_slice(&outputs, 0, Some(5), "t"),
            Err(FaceError::UnexpectedTensorShape(_))
        ));
        assert!(output_slice(&outputs, 1, None, "t").is_err());
    }

    #[test]
    fn test_assets_split() {
        let mut all = ModelAssets::new()
            .with(ModelType::FaceDetection, vec![1u8])
            .with(ModelType::Segmentation, vec![2u8]);
        let seg = all.split_off(&[ModelType::Segmentation]);
        assert!(seg.contains(ModelType::Segmentation));
        assert!(!all.contains(ModelType::Segmentation));
        assert!(all.contains(ModelType::FaceDetection));
    }
}
