//! Backend traits and the two VerifyNet implementations
//!
//! A backend is a pair of implementations: a minutiae extractor and a
//! fingerprint matcher. The matcher side is fully implemented for both the
//! channel-last reference backend and the channel-first Candle backend; the
//! extractor boundary stops at bounding boxes and scores.

pub mod candle;
pub mod reference;

use anyhow::{bail, Result};
use ndarray::{Array3, ArrayD};

/// Batch-norm epsilon shared by both backends
///
/// Both implementations must use the same value or parity degrades to the
/// scale of the epsilon difference.
pub const BN_EPS: f64 = 1e-3;

/// Input geometry of the matcher: one fingerprint is a (rows, cols, channels)
/// channel-last array of minutiae features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    /// Number of minutiae rows (the "precision" of the architecture variant)
    pub rows: usize,
    /// Number of feature columns per minutia
    pub cols: usize,
    /// Number of input channels (always 1 for minutiae data)
    pub channels: usize,
}

impl InputShape {
    /// Shape for a given precision and feature count, single channel
    pub fn new(precision: usize, features: usize) -> Self {
        Self {
            rows: precision,
            cols: features,
            channels: 1,
        }
    }

    /// Total elements in one input
    pub fn len(&self) -> usize {
        self.rows * self.cols * self.channels
    }

    /// Whether the shape is degenerate
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse a precision variant string into a row count.
///
/// Accepts plain integers ("8") and named variants whose trailing digits
/// select the row count ("float32" -> 32).
pub fn parse_precision(value: &str) -> Result<usize> {
    let digits: String = value
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        bail!("Invalid precision {value:?}: expected an integer or a variant name ending in digits");
    }
    let rows: usize = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid precision {value:?}"))?;
    if rows == 0 {
        bail!("Invalid precision {value:?}: row count must be positive");
    }
    Ok(rows)
}

/// Minutiae extraction output at the network boundary: candidate bounding
/// boxes with confidence scores. Decoding boxes into minutiae points is a
/// separate stage and is not part of this crate.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// Candidate boxes as (x1, y1, x2, y2)
    pub boxes: Vec<[f32; 4]>,
    /// Confidence score per box
    pub scores: Vec<f32>,
}

/// Minutiae extractor interface handed out by the registry
pub trait Extractor: Send + Sync {
    /// Extract candidate minutiae boxes and scores from a fingerprint image
    fn extract_minutiae(&self, image: &ArrayD<f32>) -> Result<Extraction>;
}

/// Fingerprint matcher interface handed out by the registry
pub trait Matcher: Send + Sync {
    /// Score a single anchor/sample pair, higher means more likely the same finger
    fn verify(&self, anchor: &Array3<f32>, sample: &Array3<f32>) -> Result<f32>;

    /// Score a batch of pairs, results paired by index with the input
    fn verify_batch(&self, pairs: &[(Array3<f32>, Array3<f32>)]) -> Result<Vec<f32>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precision_integer() {
        assert_eq!(parse_precision("8").unwrap(), 8);
        assert_eq!(parse_precision("24").unwrap(), 24);
    }

    #[test]
    fn test_parse_precision_named_variant() {
        assert_eq!(parse_precision("float32").unwrap(), 32);
        assert_eq!(parse_precision("float16").unwrap(), 16);
    }

    #[test]
    fn test_parse_precision_rejects_garbage() {
        assert!(parse_precision("").is_err());
        assert!(parse_precision("float").is_err());
        assert!(parse_precision("0").is_err());
    }

    #[test]
    fn test_input_shape() {
        let shape = InputShape::new(8, 9);
        assert_eq!(shape.rows, 8);
        assert_eq!(shape.cols, 9);
        assert_eq!(shape.channels, 1);
        assert_eq!(shape.len(), 72);
    }
}
