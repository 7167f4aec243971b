//! Non-maximum suppression
//!
//! Standard mode keeps the best box of each overlap group untouched. Weighted
//! mode replaces it with the score-weighted average of every box in the
//! group (keypoints included). Either way the survivor keeps the original
//! score of the group's best member.

use std::collections::HashSet;

use tracing::debug;

use crate::types::{Detection, NormalizedRect};

/// Candidate counts above this use the spatial grid instead of a full scan
const GRID_MIN_CANDIDATES: usize = 8;

/// Cells per axis of the spatial grid
const GRID_CELLS: usize = 8;

/// Suppression parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsOptions {
    pub iou_threshold: f32,
    pub score_threshold: f32,
    pub weighted: bool,
}

impl Default for NmsOptions {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            score_threshold: 0.5,
            weighted: true,
        }
    }
}

/// Deduplicate overlapping detections
pub fn non_max_suppression(detections: Vec<Detection>, options: &NmsOptions) -> Vec<Detection> {
    let mut candidates: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.score >= options.score_threshold)
        .collect();

    if candidates.is_empty() {
        return candidates;
    }

    // Sort by score (descending), stable so equal scores keep input order
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let index = OverlapIndex::build(&candidates, options.iou_threshold);
    let mut processed = vec![false; candidates.len()];
    let mut keep = Vec::new();

    for i in 0..candidates.len() {
        if processed[i] {
            continue;
        }
        processed[i] = true;

        let anchor = &candidates[i];
        let mut group = vec![i];
        for j in index.neighbours(i) {
            if processed[j] {
                continue;
            }
            if anchor.rect.iou(&candidates[j].rect) > options.iou_threshold {
                processed[j] = true;
                group.push(j);
            }
        }

        if options.weighted && group.len() > 1 {
            keep.push(weighted_merge(&candidates, &group));
        } else {
            keep.push(anchor.clone());
        }
    }

    debug!(
        "NMS kept {} of {} candidates ({})",
        keep.len(),
        candidates.len(),
        if index.is_grid() { "grid" } else { "pairwise" }
    );

    keep
}

/// Score-weighted average of a group; score and image size come from the
/// group's first (best) member.
fn weighted_merge(candidates: &[Detection], group: &[usize]) -> Detection {
    let best = &candidates[group[0]];
    let total: f32 = group.iter().map(|&g| candidates[g].score).sum();

    if !(total > 0.0) {
        return best.clone();
    }

    let mut rect = NormalizedRect::new(0.0, 0.0, 0.0, 0.0);
    let mut keypoints = vec![0.0; best.keypoints.len()];

    for &g in group {
        let d = &candidates[g];
        let w = d.score / total;
        rect.xmin += d.rect.xmin * w;
        rect.ymin += d.rect.ymin * w;
        rect.xmax += d.rect.xmax * w;
        rect.ymax += d.rect.ymax * w;
        for (acc, &kp) in keypoints.iter_mut().zip(&d.keypoints) {
            *acc += kp * w;
        }
    }

    Detection {
        rect,
        score: best.score,
        keypoints,
        image_size: best.image_size,
    }
}

/// Neighbour lookup over the sorted candidates
///
/// With the grid, each box is registered in every cell it touches, and a
/// query returns every box sharing a cell with the query box. Two boxes with
/// positive intersection always share a cell, so for a non-negative IoU
/// threshold this returns a superset of the overlapping boxes and the result
/// matches the pairwise scan.
enum OverlapIndex {
    Pairwise {
        len: usize,
    },
    Grid {
        cells: Vec<Vec<usize>>,
        spans: Vec<CellSpan>,
    },
}

#[derive(Debug, Clone, Copy)]
struct CellSpan {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
}

impl OverlapIndex {
    fn build(candidates: &[Detection], iou_threshold: f32) -> Self {
        let all_finite = candidates.iter().all(|d| {
            let r = &d.rect;
            r.xmin.is_finite() && r.ymin.is_finite() && r.xmax.is_finite() && r.ymax.is_finite()
        });

        // A negative threshold lets disjoint boxes merge, so locality can't be used.
        if candidates.len() <= GRID_MIN_CANDIDATES || iou_threshold < 0.0 || !all_finite {
            return OverlapIndex::Pairwise {
                len: candidates.len(),
            };
        }

        let min_x = candidates.iter().map(|d| d.rect.xmin).fold(f32::INFINITY, f32::min);
        let min_y = candidates.iter().map(|d| d.rect.ymin).fold(f32::INFINITY, f32::min);
        let max_x = candidates.iter().map(|d| d.rect.xmax).fold(f32::NEG_INFINITY, f32::max);
        let max_y = candidates.iter().map(|d| d.rect.ymax).fold(f32::NEG_INFINITY, f32::max);

        let extent_x = (max_x - min_x).max(f32::EPSILON);
        let extent_y = (max_y - min_y).max(f32::EPSILON);

        let cell_of = |v: f32, min: f32, extent: f32| -> usize {
            let c = ((v - min) / extent * GRID_CELLS as f32).floor();
            (c.max(0.0) as usize).min(GRID_CELLS - 1)
        };

        let mut cells = vec![Vec::new(); GRID_CELLS * GRID_CELLS];
        let mut spans = Vec::with_capacity(candidates.len());

        for (i, d) in candidates.iter().enumerate() {
            // Inverted boxes have no area; register them by their corner span anyway.
            let (xa, xb) = (d.rect.xmin.min(d.rect.xmax), d.rect.xmin.max(d.rect.xmax));
            let (ya, yb) = (d.rect.ymin.min(d.rect.ymax), d.rect.ymin.max(d.rect.ymax));
            let span = CellSpan {
                x0: cell_of(xa, min_x, extent_x),
                y0: cell_of(ya, min_y, extent_y),
                x1: cell_of(xb, min_x, extent_x),
                y1: cell_of(yb, min_y, extent_y),
            };
            for cy in span.y0..=span.y1 {
                for cx in span.x0..=span.x1 {
                    cells[cy * GRID_CELLS + cx].push(i);
                }
            }
            spans.push(span);
        }

        OverlapIndex::Grid { cells, spans }
    }

    fn is_grid(&self) -> bool {
        matches!(self, OverlapIndex::Grid { .. })
    }

    /// Candidates after `i` (in score order) that may overlap it
    fn neighbours(&self, i: usize) -> Vec<usize> {
        match self {
            OverlapIndex::Pairwise { len } => ((i + 1)..*len).collect(),
            OverlapIndex::Grid { cells, spans } => {
                let span = spans[i];
                let mut seen = HashSet::new();
                for cy in span.y0..=span.y1 {
                    for cx in span.x0..=span.x1 {
                        for &j in &cells[cy * GRID_CELLS + cx] {
                            if j > i {
                                seen.insert(j);
                            }
                        }
                    }
                }
                let mut out: Vec<usize> = seen.into_iter().collect();
                out.sort_unstable();
                out
            }
        }
    }
}
