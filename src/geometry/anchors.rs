//! SSD anchor generation
//!
//! Anchors are emitted in exactly the order the detector concatenates its
//! per-layer outputs: layers with equal strides are merged, cells are walked
//! row-major, and each cell repeats its center once per anchor.

use serde::{Deserialize, Serialize};

use crate::error::{FaceError, Result};

/// Geometry of a detection model's anchor grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorOptions {
    pub input_width: u32,
    pub input_height: u32,
    /// One stride per output layer, in output order
    pub strides: Vec<u32>,
    /// Anchors emitted per layer per cell (aspect ratios plus the
    /// interpolated-scale anchor)
    pub anchors_per_layer: u32,
}

/// Supported face detection models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionModel {
    /// Front camera, faces within ~2m
    #[default]
    ShortRange,
    /// Faces up to ~5m, single dense layer
    FullRange,
    /// Rear camera, higher resolution input
    BackCamera,
}

impl DetectionModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionModel::ShortRange => "short_range",
            DetectionModel::FullRange => "full_range",
            DetectionModel::BackCamera => "back_camera",
        }
    }

    pub fn anchor_options(&self) -> AnchorOptions {
        match self {
            DetectionModel::ShortRange => AnchorOptions {
                input_width: 128,
                input_height: 128,
                strides: vec![8, 16, 16, 16],
                anchors_per_layer: 2,
            },
            DetectionModel::FullRange => AnchorOptions {
                input_width: 192,
                input_height: 192,
                strides: vec![4],
                anchors_per_layer: 1,
            },
            DetectionModel::BackCamera => AnchorOptions {
                input_width: 256,
                input_height: 256,
                strides: vec![16, 32, 32, 32],
                anchors_per_layer: 2,
            },
        }
    }

    /// Square input edge in pixels
    pub fn input_size(&self) -> u32 {
        self.anchor_options().input_width
    }
}

/// Generate the flat anchor list `[x0, y0, x1, y1, ...]`
///
/// Every coordinate falls in `(0, 1]`. Output is deterministic for a given
/// geometry.
pub fn generate_anchors(options: &AnchorOptions) -> Result<Vec<f32>> {
    if options.strides.is_empty() {
        return Err(FaceError::invalid("anchor options need at least one stride"));
    }
    if options.anchors_per_layer == 0 {
        return Err(FaceError::invalid("anchors_per_layer must be positive"));
    }

    let mut anchors = Vec::with_capacity(anchor_count(options) * 2);
    let mut layer = 0;

    while layer < options.strides.len() {
        let stride = options.strides[layer];
        if stride == 0 || stride > options.input_width || stride > options.input_height {
            return Err(FaceError::invalid(format!(
                "stride {} does not fit a {}x{} input",
                stride, options.input_width, options.input_height
            )));
        }

        // Consecutive layers with the same stride share one grid pass.
        let mut repeats = 0;
        while layer < options.strides.len() && options.strides[layer] == stride {
            repeats += options.anchors_per_layer;
            layer += 1;
        }

        let grid_w = options.input_width.div_ceil(stride);
        let grid_h = options.input_height.div_ceil(stride);

        for row in 0..grid_h {
            let cy = (row as f32 + 0.5) / grid_h as f32;
            for col in 0..grid_w {
                let cx = (col as f32 + 0.5) / grid_w as f32;
                for _ in 0..repeats {
                    anchors.push(cx);
                    anchors.push(cy);
                }
            }
        }
    }

    Ok(anchors)
}

/// Number of anchors `generate_anchors` will emit
pub fn anchor_count(options: &AnchorOptions) -> usize {
    options
        .strides
        .iter()
        .filter(|&&s| s > 0)
        .map(|&s| {
            let grid_w = options.input_width.div_ceil(s) as usize;
            let grid_h = options.input_height.div_ceil(s) as usize;
            grid_w * grid_h * options.anchors_per_layer as usize
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_MODELS: [DetectionModel; 3] = [
        DetectionModel::ShortRange,
        DetectionModel::FullRange,
        DetectionModel::BackCamera,
    ];

    #[test]
    fn test_anchor_counts() {
        let short = generate_anchors(&DetectionModel::ShortRange.anchor_options()).unwrap();
        assert_eq!(short.len() / 2, 896);

        let full = generate_anchors(&DetectionModel::FullRange.anchor_options()).unwrap();
        assert_eq!(full.len() / 2, 2304);

        let back = generate_anchors(&DetectionModel::BackCamera.anchor_options()).unwrap();
        assert_eq!(back.len() / 2, 896);
    }

    #[test]
    fn test_anchors_in_unit_range() {
        for model in ALL_MODELS {
            let anchors = generate_anchors(&model.anchor_options()).unwrap();
            assert!(!anchors.is_empty());
            assert_eq!(anchors.len() % 2, 0);
            assert!(anchors.iter().all(|&v| v > 0.0 && v <= 1.0), "{}", model.as_str());
            assert_eq!(anchors.len() / 2, anchor_count(&model.anchor_options()));
        }
    }

    #[test]
    fn test_anchor_order_matches_output_layout() {
        let anchors = generate_anchors(&DetectionModel::ShortRange.anchor_options()).unwrap();
        // First cell of the 16x16 grid, twice.
        assert_eq!(&anchors[..4], &[0.5 / 16.0, 0.5 / 16.0, 0.5 / 16.0, 0.5 / 16.0]);
        // Second cell moves along x.
        assert!((anchors[4] - 1.5 / 16.0).abs() < 1e-7);
        // Merged 8x8 layers start after 512 anchors with 6 repeats per cell.
        let start = 512 * 2;
        for k in 0..6 {
            assert!((anchors[start + k * 2] - 0.5 / 8.0).abs() < 1e-7);
        }
        assert!((anchors[start + 12] - 1.5 / 8.0).abs() < 1e-7);
    }

    #[test]
    fn test_shared_geometry_gives_equal_counts() {
        let a = DetectionModel::ShortRange.anchor_options();
        let b = AnchorOptions {
            input_width: 256,
            input_height: 256,
            strides: vec![16, 32, 32, 32],
            anchors_per_layer: 2,
        };
        assert_eq!(
            generate_anchors(&a).unwrap().len(),
            generate_anchors(&b).unwrap().len()
        );
    }

    #[test]
    fn test_deterministic() {
        let opts = DetectionModel::BackCamera.anchor_options();
        let first = generate_anchors(&opts).unwrap();
        let second = generate_anchors(&opts).unwrap();
        assert_eq!(
            first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_invalid_options() {
        let mut opts = DetectionModel::ShortRange.anchor_options();
        opts.strides.clear();
        assert!(generate_anchors(&opts).is_err());

        let mut opts = DetectionModel::ShortRange.anchor_options();
        opts.strides = vec![0];
        assert!(generate_anchors(&opts).is_err());
    }
}
