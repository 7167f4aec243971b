//! Eye and iris point-list parsing
//!
//! The iris sub-model comes in variants that emit iris-only points or eye
//! mesh plus iris, for one or both eyes, concatenated into a single list.
//! The layout is recovered from the point count alone.

use crate::types::{Eye, EyePair, Point};

/// Points per iris group (center plus four contour points)
pub const IRIS_POINTS: usize = 5;

/// Eye-region mesh points emitted alongside each iris by mesh-capable models
pub const EYE_MESH_POINTS: usize = 71;

/// Point-list layout, keyed on count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EyeLayout {
    /// Fewer than five points
    Empty,
    /// Exactly 5: one iris, no mesh
    LegacySingle,
    /// Exactly 10: two irises, no mesh
    LegacyPair,
    /// Exactly 76: one eye, 71 mesh + 5 iris
    MeshSingle,
    /// Exactly 152: two eyes, 71 mesh + 5 iris each
    MeshPair,
    /// Any other even count above 10: halves, last 5 of each are iris
    SplitPair { half: usize },
    /// Remaining counts (6-9 and odd counts above 10): last 5 are iris
    TrailingSingle,
}

impl EyeLayout {
    pub fn classify(count: usize) -> Self {
        match count {
            0..=4 => EyeLayout::Empty,
            5 => EyeLayout::LegacySingle,
            10 => EyeLayout::LegacyPair,
            76 => EyeLayout::MeshSingle,
            152 => EyeLayout::MeshPair,
            n if n > 10 && n % 2 == 0 => EyeLayout::SplitPair { half: n / 2 },
            _ => EyeLayout::TrailingSingle,
        }
    }
}

/// Parse a combined eye/iris point list
///
/// Returns `None` when the list holds fewer than five points. A single eye
/// is reported in the `left` slot; for two eyes the first half is the left
/// eye and the second half the right eye.
pub fn parse_eyes(points: &[Point]) -> Option<EyePair> {
    let pair = match EyeLayout::classify(points.len()) {
        EyeLayout::Empty => return None,
        EyeLayout::LegacySingle | EyeLayout::MeshSingle | EyeLayout::TrailingSingle => EyePair {
            left: Some(parse_single(points)),
            right: None,
        },
        EyeLayout::LegacyPair => EyePair {
            left: Some(parse_single(&points[..IRIS_POINTS])),
            right: Some(parse_single(&points[IRIS_POINTS..])),
        },
        EyeLayout::MeshPair => {
            let half = EYE_MESH_POINTS + IRIS_POINTS;
            EyePair {
                left: Some(parse_single(&points[..half])),
                right: Some(parse_single(&points[half..])),
            }
        }
        EyeLayout::SplitPair { half } => EyePair {
            left: Some(parse_single(&points[..half])),
            right: Some(parse_single(&points[half..])),
        },
    };
    Some(pair)
}

/// One eye: the trailing five points are the iris, anything before is mesh.
fn parse_single(points: &[Point]) -> Eye {
    let split = points.len() - IRIS_POINTS;
    let (mesh, iris) = points.split_at(split);
    let (center, contour) = split_iris(iris);
    Eye {
        iris_center: center,
        iris_contour: contour,
        mesh: mesh.to_vec(),
    }
}

/// Pick the iris center and return the remaining points in original order
///
/// The center minimizes the summed squared distance to the other points;
/// ties go to the first occurrence.
pub fn split_iris(iris: &[Point]) -> (Point, Vec<Point>) {
    let mut best = 0;
    let mut best_cost = f32::INFINITY;

    for (i, p) in iris.iter().enumerate() {
        let cost: f32 = iris
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .map(|(_, q)| p.distance_sq(q))
            .sum();
        if cost < best_cost {
            best_cost = cost;
            best = i;
        }
    }

    let contour = iris
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != best)
        .map(|(_, p)| *p)
        .collect();
    (iris[best], contour)
}
