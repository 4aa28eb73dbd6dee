//! Parity and throughput checks between the reference and Candle backends
//!
//! Both models share one seed: the reference model's weights are mirrored
//! into the Candle model through the converter, so any disagreement beyond
//! tolerance is a conversion defect, not noise.

use fingermatch::parity::{compare_batch, compare_scalars, BATCH_TOLERANCE, SCALAR_TOLERANCE};
use fingermatch::{HarnessConfig, ParityHarness};

fn harness(dataset_size: usize) -> ParityHarness {
    ParityHarness::new(HarnessConfig {
        precision: 8,
        features: 9,
        dataset_size,
        seed: 2024,
        ..Default::default()
    })
    .expect("harness construction")
}

/// Single-pair scores must agree within 1e-4 on every generated pair
#[test]
fn test_pairwise_predictions_align() {
    let harness = harness(6);
    for index in 0..harness.dataset_size() {
        let reference = harness.reference_score(index).unwrap();
        let candle = harness.candle_score(index).unwrap();
        let report = compare_scalars(reference, candle, SCALAR_TOLERANCE);
        assert!(
            report.matches,
            "pair {index}: reference={reference}, candle={candle}, max_abs_diff={}",
            report.max_abs_diff
        );
    }
    harness.close().unwrap();
}

/// Batched scores must agree within 1e-5 across backends
#[test]
fn test_batch_predictions_align() {
    let harness = harness(6);
    let reference = harness.reference_batch().unwrap();
    let candle = harness.candle_batch().unwrap();
    assert_eq!(reference.len(), 6);
    let report = compare_batch(&reference, &candle, BATCH_TOLERANCE).unwrap();
    assert!(
        report.matches,
        "batch disagreement: max_abs_diff={}",
        report.max_abs_diff
    );
    harness.close().unwrap();
}

/// Batched scores must agree with the per-pair scores on the same backend
#[test]
fn test_batch_matches_single_pair_scores() {
    let harness = harness(6);

    let reference_batch = harness.reference_batch().unwrap();
    let candle_batch = harness.candle_batch().unwrap();
    for index in 0..harness.dataset_size() {
        let reference_single = harness.reference_score(index).unwrap();
        let candle_single = harness.candle_score(index).unwrap();
        assert!(
            compare_scalars(reference_batch[index], reference_single, BATCH_TOLERANCE).matches,
            "reference pair {index} drifts between batch and single inference"
        );
        assert!(
            compare_scalars(candle_batch[index], candle_single, BATCH_TOLERANCE).matches,
            "candle pair {index} drifts between batch and single inference"
        );
    }
    harness.close().unwrap();
}

/// Scores are probabilities and must land strictly inside the unit interval
#[test]
fn test_scores_are_probabilities() {
    let harness = harness(4);
    for score in harness.reference_batch().unwrap() {
        assert!(score > 0.0 && score < 1.0, "reference score {score}");
    }
    for score in harness.candle_batch().unwrap() {
        assert!(score > 0.0 && score < 1.0, "candle score {score}");
    }
    harness.close().unwrap();
}

/// The models the harness exposes score exactly like the harness itself,
/// so callers can run their own inputs through either backend
#[test]
fn test_exposed_models_match_harness_scores() {
    let harness = harness(3);
    for (index, (anchor, sample)) in harness.pairs().enumerate() {
        let reference = harness.reference().predict(anchor, sample).unwrap();
        let candle = harness.converted().predict(anchor, sample).unwrap();
        assert_eq!(reference, harness.reference_score(index).unwrap());
        assert_eq!(candle, harness.candle_score(index).unwrap());
    }
    harness.close().unwrap();
}

/// Throughput is asserted positive only; the backends take different
/// hardware paths and are not comparable head to head
#[test]
fn test_throughput_is_positive() {
    let harness = harness(8);
    let (reference_rate, candle_rate) = harness.measure_throughput(3).unwrap();
    assert!(reference_rate > 0.0);
    assert!(candle_rate > 0.0);
    harness.close().unwrap();
}
