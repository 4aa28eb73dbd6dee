//! Numerical equivalence checks between paired backend outputs
//!
//! Comparisons are absolute-tolerance by index; reports also carry the
//! relative difference for diagnostics. A disagreement is never corrected or
//! retried, it signals a real mapping defect.

use anyhow::{bail, Result};

/// Default tolerance for single-pair score comparisons
pub const SCALAR_TOLERANCE: f32 = 1e-4;
/// Default tolerance for element-wise batch comparisons
pub const BATCH_TOLERANCE: f32 = 1e-5;

/// Outcome of one comparison; derived, never stored
#[derive(Debug, Clone, Copy)]
pub struct EquivalenceReport {
    /// Largest absolute difference across compared elements
    pub max_abs_diff: f32,
    /// Largest relative difference across compared elements
    pub max_rel_diff: f32,
    /// Whether every element is within the absolute tolerance
    pub matches: bool,
}

impl EquivalenceReport {
    fn from_pairs<'a, I>(pairs: I, tolerance: f32) -> Self
    where
        I: IntoIterator<Item = (&'a f32, &'a f32)>,
    {
        let mut max_abs_diff = 0.0f32;
        let mut max_rel_diff = 0.0f32;
        let mut matches = true;
        for (&a, &b) in pairs {
            let abs = (a - b).abs();
            let scale = a.abs().max(b.abs()).max(f32::EPSILON);
            // NaN comparisons are false, so a NaN difference fails the check;
            // once seen it pins the reported maxima, since f32::max would
            // silently drop the NaN on the next finite pair.
            matches &= abs <= tolerance;
            if abs.is_nan() {
                max_abs_diff = f32::NAN;
                max_rel_diff = f32::NAN;
            } else if !max_abs_diff.is_nan() {
                max_abs_diff = max_abs_diff.max(abs);
                max_rel_diff = max_rel_diff.max(abs / scale);
            }
        }
        Self {
            max_abs_diff,
            max_rel_diff,
            matches,
        }
    }
}

/// Compare two scalar scores within `tolerance`
pub fn compare_scalars(a: f32, b: f32, tolerance: f32) -> EquivalenceReport {
    EquivalenceReport::from_pairs([(&a, &b)], tolerance)
}

/// Compare two equal-length score sequences element-wise, paired by index.
///
/// A length mismatch is an error: the sequences are positionally paired and
/// must never be sorted or matched up.
pub fn compare_batch(a: &[f32], b: &[f32], tolerance: f32) -> Result<EquivalenceReport> {
    if a.len() != b.len() {
        bail!(
            "Cannot compare batches of different lengths: {} vs {}",
            a.len(),
            b.len()
        );
    }
    Ok(EquivalenceReport::from_pairs(a.iter().zip(b.iter()), tolerance))
}
