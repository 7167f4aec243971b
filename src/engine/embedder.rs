//! MobileFaceNet Face Embedder
//!
//! Eye-aligned 112x112 crops in, L2-normalized feature vectors out.

use std::sync::Arc;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use super::pool::{output_slice, run_tensor, ModelPool, ModelType};
use super::preprocess::{crop_aligned_into, input_tensor, Frame, Normalization};
use crate::error::{FaceError, Result};
use crate::geometry::transform::embedding_alignment_for;
use crate::types::Detection;
use crate::utils::math::{cosine_similarity, l2_normalize};

/// Embedding model input edge
pub const EMBEDDER_INPUT_SIZE: u32 = 112;

/// Face embedding result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub vector: Vec<f32>,
    /// Norm of the raw model output before normalization
    pub norm: f32,
}

impl FaceEmbedding {
    /// Create a new normalized embedding
    pub fn new(mut vector: Vec<f32>) -> Self {
        let norm = l2_normalize(&mut vector);
        Self { vector, norm }
    }

    /// Compute cosine similarity with another embedding
    pub fn cosine_similarity(&self, other: &FaceEmbedding) -> f32 {
        cosine_similarity(&self.vector, &other.vector)
    }
}

/// MobileFaceNet Face Embedder
pub struct FaceEmbedder {
    pool: Arc<ModelPool>,
    input: Option<Array4<f32>>,
}

impl FaceEmbedder {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self { pool, input: None }
    }

    /// Embed the face of one detection (which must carry its image size)
    pub async fn embed(&mut self, frame: &Frame, detection: &Detection) -> Result<FaceEmbedding> {
        let roi = embedding_alignment_for(detection)?;

        let mut input = input_tensor(self.input.take(), EMBEDDER_INPUT_SIZE);
        crop_aligned_into(frame, &roi, EMBEDDER_INPUT_SIZE, false, Normalization::SignedUnit, &mut input)?;

        let model = self.pool.get_model(ModelType::Embedding)?;
        let (outputs, input) = run_tensor(&model, input).await?;
        self.input = Some(input);

        let vector = output_slice(&outputs, 0, None, "embedding")?;
        if vector.is_empty() {
            return Err(FaceError::shape("embedding output is empty"));
        }
        Ok(FaceEmbedding::new(vector.to_vec()))
    }

    /// Embed several faces of the same frame, in order
    pub async fn embed_batch(&mut self, frame: &Frame, detections: &[Detection]) -> Result<Vec<FaceEmbedding>> {
        let mut embeddings = Vec::with_capacity(detections.len());
        for detection in detections {
            embeddings.push(self.embed(frame, detection).await?);
        }
        Ok(embeddings)
    }
}
