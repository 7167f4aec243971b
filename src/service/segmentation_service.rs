//! Segmentation Service - segmentation pipeline of one worker context

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::config::SegmentationConfig;
use crate::engine::{Frame, ModelPool, Segmentation, Segmenter};
use crate::error::Result;
use crate::geometry::{MaskFormat, MaskPayload};

pub struct SegmentationService {
    pool: Arc<ModelPool>,
    segmenter: Segmenter,
    format: MaskFormat,
    binary_threshold: f32,
}

impl SegmentationService {
    pub fn new(pool: Arc<ModelPool>, config: &SegmentationConfig) -> Self {
        Self {
            segmenter: Segmenter::new(pool.clone(), config.model),
            pool,
            format: config.mask_format,
            binary_threshold: config.binary_threshold,
        }
    }

    /// Segment an encoded image into a wire payload
    pub async fn segment(&mut self, image_data: &[u8]) -> Result<MaskPayload> {
        let frame = Frame::decode(image_data)?;
        self.segment_frame_payload(&frame).await
    }

    /// Segment raw RGBA pixels into a wire payload
    pub async fn segment_from_pixels(&mut self, width: u32, height: u32, pixels: &[u8]) -> Result<MaskPayload> {
        let frame = Frame::from_rgba(width, height, pixels)?;
        self.segment_frame_payload(&frame).await
    }

    /// Segment a frame, keeping the typed mask
    pub async fn segment_frame(&mut self, frame: &Frame) -> Result<Segmentation> {
        let start = Instant::now();
        let result = self.segmenter.segment(frame).await?;
        info!(
            "Segmented {}x{} frame in {}ms",
            frame.size().width,
            frame.size().height,
            start.elapsed().as_millis()
        );
        Ok(result)
    }

    async fn segment_frame_payload(&mut self, frame: &Frame) -> Result<MaskPayload> {
        let result = self.segment_frame(frame).await?;
        Ok(result.to_payload(self.format, self.binary_threshold))
    }

    /// Drop the loaded model and stop idle cleanup
    pub fn release(&self) {
        self.pool.release_all();
        self.pool.shutdown();
    }
}
