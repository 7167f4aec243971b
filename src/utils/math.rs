//! Math utility functions

use std::f32::consts::LOG2_E;

/// Default symmetric clamp applied to score logits before the sigmoid
pub const DEFAULT_SCORE_CLIP: f32 = 100.0;

/// Logit range over which [`fast_exp`] is accurate; inputs outside saturate
pub const FAST_EXP_RANGE: f32 = 20.0;

/// Sigmoid with the logit clamped to `[-clip, clip]`
#[inline]
pub fn clipped_sigmoid(x: f32, clip: f32) -> f32 {
    let x = x.clamp(-clip, clip);
    1.0 / (1.0 + (-x).exp())
}

/// Approximate `e^x`, within 0.2% over `[-20, 20]`, saturating outside it
///
/// Splits `x * log2(e)` into integer and fractional parts; the integer part
/// goes straight into the exponent bits and `2^f` comes from a 4th-order
/// polynomial.
#[inline]
pub fn fast_exp(x: f32) -> f32 {
    let t = x.clamp(-FAST_EXP_RANGE, FAST_EXP_RANGE) * LOG2_E;
    let i = t.floor();
    let f = t - i;
    let p = 1.0
        + f * (0.693_147_2 + f * (0.240_226_5 + f * (0.055_504_1 + f * (0.009_618_1 + f * 0.001_333_6))));
    let bits = ((i as i32 + 127) as u32) << 23;
    p * f32::from_bits(bits)
}

/// Numerically stable softmax, written into `out`
///
/// `out` must be the same length as `logits`.
pub fn softmax_into(logits: &[f32], out: &mut [f32]) {
    debug_assert_eq!(logits.len(), out.len());
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for (o, &v) in out.iter_mut().zip(logits) {
        *o = fast_exp(v - max_val);
        sum += *o;
    }
    if sum > 0.0 {
        for o in out.iter_mut() {
            *o /= sum;
        }
    }
}

/// L2 normalize a vector in place, returning the original norm
pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipped_sigmoid() {
        assert!((clipped_sigmoid(0.0, DEFAULT_SCORE_CLIP) - 0.5).abs() < 1e-6);
        assert!(clipped_sigmoid(10.0, DEFAULT_SCORE_CLIP) > 0.999);
        assert!(clipped_sigmoid(-10.0, DEFAULT_SCORE_CLIP) < 0.001);
        // Extreme logits stay finite.
        assert!(clipped_sigmoid(-1e30, DEFAULT_SCORE_CLIP).is_finite());
        assert_eq!(clipped_sigmoid(5.0, 1.0), clipped_sigmoid(1.0, 1.0));
    }

    #[test]
    fn test_fast_exp_accuracy() {
        let mut x = -20.0f32;
        while x <= 20.0 {
            let exact = x.exp();
            let approx = fast_exp(x);
            assert!(((approx - exact) / exact).abs() < 0.01, "x={x}");
            x += 0.37;
        }
    }

    #[test]
    fn test_fast_exp_saturates() {
        assert_eq!(fast_exp(-100.0), fast_exp(-20.0));
        assert_eq!(fast_exp(100.0), fast_exp(20.0));
        assert!(fast_exp(-100.0) > 0.0);
    }

    #[test]
    fn test_softmax() {
        let x = [1.0, 2.0, 3.0];
        let mut result = [0.0; 3];
        softmax_into(&x, &mut result);
        let sum: f32 = result.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(result[2] > result[1] && result[1] > result[0]);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        let norm = l2_normalize(&mut v);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-6);
    }
}
