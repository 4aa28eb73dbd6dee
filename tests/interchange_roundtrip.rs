//! Export round-trip: the interchange runtime must reproduce the Candle
//! model it was exported from

use candle_core::{Device, Tensor};
use fingermatch::backend::candle::CandleVerifyNet;
use fingermatch::backend::InputShape;
use fingermatch::interchange::{export_matcher, InterchangeSession};
use fingermatch::parity::{compare_batch, BATCH_TOLERANCE};
use ndarray::{Array, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ROWS: usize = 64;
const COLS: usize = 64;

fn random_nchw(rng: &mut StdRng, batch: usize) -> ArrayD<f32> {
    let values: Vec<f32> = (0..batch * ROWS * COLS)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Array::from_shape_vec(IxDyn(&[batch, 1, ROWS, COLS]), values).unwrap()
}

fn nchw_tensor(array: &ArrayD<f32>) -> Tensor {
    let dims = array.shape();
    Tensor::from_vec(
        array.iter().copied().collect::<Vec<f32>>(),
        (dims[0], dims[1], dims[2], dims[3]),
        &Device::Cpu,
    )
    .unwrap()
}

fn exported_session(model: &CandleVerifyNet) -> InterchangeSession {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("verify_net.json");
    let representative = Array::zeros(IxDyn(&[1, 1, ROWS, COLS]));
    export_matcher(model, &representative, &path).unwrap();
    InterchangeSession::load(&path).unwrap()
}

/// Exported graph scores a (2, 1, 64, 64) batch within 1e-5 of the model
#[test]
fn test_exported_graph_reproduces_model_scores() {
    let model = CandleVerifyNet::new_random(InputShape::new(ROWS, COLS), &Device::Cpu).unwrap();
    let session = exported_session(&model);
    assert_eq!(session.input_names(), vec!["anchor", "sample"]);

    let mut rng = StdRng::seed_from_u64(2024);
    let anchor = random_nchw(&mut rng, 2);
    let sample = random_nchw(&mut rng, 2);

    let in_memory = model
        .forward_batch(&nchw_tensor(&anchor), &nchw_tensor(&sample))
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap();

    let outputs = session.run(&[anchor, sample]).unwrap();
    assert_eq!(outputs[0].shape(), &[2, 1]);
    let exported: Vec<f32> = outputs[0].iter().copied().collect();

    let report = compare_batch(&in_memory, &exported, BATCH_TOLERANCE).unwrap();
    assert!(
        report.matches,
        "round-trip disagreement: max_abs_diff={}",
        report.max_abs_diff
    );
}

/// The batch axis is dynamic: any consistent batch extent runs
#[test]
fn test_exported_graph_accepts_other_batch_sizes() {
    let model = CandleVerifyNet::new_random(InputShape::new(ROWS, COLS), &Device::Cpu).unwrap();
    let session = exported_session(&model);

    let mut rng = StdRng::seed_from_u64(7);
    for batch in [1usize, 3] {
        let anchor = random_nchw(&mut rng, batch);
        let sample = random_nchw(&mut rng, batch);
        let outputs = session.run(&[anchor, sample]).unwrap();
        assert_eq!(outputs[0].shape(), &[batch, 1]);
        for &score in outputs[0].iter() {
            assert!((0.0..=1.0).contains(&score), "score {score}");
        }
    }
}

/// Spatial extents are fixed at export time and must be enforced
#[test]
fn test_exported_graph_rejects_wrong_spatial_extent() {
    let model = CandleVerifyNet::new_random(InputShape::new(ROWS, COLS), &Device::Cpu).unwrap();
    let session = exported_session(&model);

    let mut rng = StdRng::seed_from_u64(7);
    let anchor = random_nchw(&mut rng, 1);
    let wrong: ArrayD<f32> = Array::zeros(IxDyn(&[1, 1, ROWS, COLS + 1]));
    let err = session.run(&[anchor, wrong]).unwrap_err();
    assert!(err.to_string().contains("axis 3"));
}

/// Mismatched batch extents across the two inputs must be rejected
#[test]
fn test_exported_graph_rejects_inconsistent_batch() {
    let model = CandleVerifyNet::new_random(InputShape::new(ROWS, COLS), &Device::Cpu).unwrap();
    let session = exported_session(&model);

    let mut rng = StdRng::seed_from_u64(7);
    let anchor = random_nchw(&mut rng, 2);
    let sample = random_nchw(&mut rng, 3);
    let err = session.run(&[anchor, sample]).unwrap_err();
    assert!(err.to_string().contains("batch"));
}
