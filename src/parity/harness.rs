//! Twin-model parity harness
//!
//! Builds the reference model with deterministic seeded weights, mirrors
//! those weights into a Candle model through the converter, and generates one
//! fixed evaluation dataset from the same seed. Every check in a test run
//! reuses that dataset; regenerating it per call would break determinism.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::time::Instant;
use tracing::info;

use crate::backend::candle::CandleVerifyNet;
use crate::backend::reference::ReferenceVerifyNet;
use crate::backend::InputShape;
use crate::convert::convert;
use crate::DEFAULT_FEATURES;

/// Parity harness construction parameters
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Minutiae rows (architecture precision variant)
    pub precision: usize,
    /// Feature columns per minutia
    pub features: usize,
    /// Number of anchor/sample pairs in the fixed dataset
    pub dataset_size: usize,
    /// Seed shared by weight init and dataset generation
    pub seed: u64,
    /// Device the Candle backend runs on
    pub device: Device,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            precision: 8,
            features: DEFAULT_FEATURES,
            dataset_size: 4,
            seed: 2024,
            device: Device::Cpu,
        }
    }
}

/// Holds one reference model, one weight-equivalent Candle model, and the
/// fixed evaluation dataset. Created at test setup, torn down with
/// [`ParityHarness::close`]; nothing persists across test cases.
pub struct ParityHarness {
    reference: ReferenceVerifyNet,
    converted: CandleVerifyNet,
    anchors: Vec<Array3<f32>>,
    samples: Vec<Array3<f32>>,
    anchor_tensor: Tensor,
    sample_tensor: Tensor,
}

impl ParityHarness {
    /// Build both models from one seed and synchronize them via the converter
    pub fn new(config: HarnessConfig) -> Result<Self> {
        if config.dataset_size == 0 {
            bail!("Parity harness needs at least one evaluation pair");
        }
        let shape = InputShape::new(config.precision, config.features);
        let mut rng = StdRng::seed_from_u64(config.seed);

        let reference = ReferenceVerifyNet::from_rng(shape, &mut rng)?;
        let converted = CandleVerifyNet::new_random(shape, &config.device)?;
        convert(&reference, &converted)?;
        info!(
            precision = config.precision,
            features = config.features,
            seed = config.seed,
            "parity harness models synchronized"
        );

        let mut draw = |rng: &mut StdRng| -> Array3<f32> {
            let mut array = Array3::<f32>::zeros((shape.rows, shape.cols, shape.channels));
            for v in array.iter_mut() {
                *v = rng.sample::<f32, _>(StandardNormal);
            }
            array
        };
        let anchors: Vec<Array3<f32>> = (0..config.dataset_size).map(|_| draw(&mut rng)).collect();
        let samples: Vec<Array3<f32>> = (0..config.dataset_size).map(|_| draw(&mut rng)).collect();
        let anchor_tensor = converted.prepare_batch(&anchors)?;
        let sample_tensor = converted.prepare_batch(&samples)?;

        Ok(Self {
            reference,
            converted,
            anchors,
            samples,
            anchor_tensor,
            sample_tensor,
        })
    }

    /// Number of pairs in the fixed dataset
    pub fn dataset_size(&self) -> usize {
        self.anchors.len()
    }

    /// The weight-synchronized Candle model
    pub fn converted(&self) -> &CandleVerifyNet {
        &self.converted
    }

    /// The seeded reference model
    pub fn reference(&self) -> &ReferenceVerifyNet {
        &self.reference
    }

    /// Iterate the fixed anchor/sample pairs
    pub fn pairs(&self) -> impl Iterator<Item = (&Array3<f32>, &Array3<f32>)> {
        self.anchors.iter().zip(self.samples.iter())
    }

    /// Single-pair score on the reference backend
    pub fn reference_score(&self, index: usize) -> Result<f32> {
        self.check_index(index)?;
        self.reference
            .predict(&self.anchors[index], &self.samples[index])
    }

    /// Single-pair score on the Candle backend
    pub fn candle_score(&self, index: usize) -> Result<f32> {
        self.check_index(index)?;
        self.converted
            .predict(&self.anchors[index], &self.samples[index])
    }

    /// Full-batch scores on the reference backend
    pub fn reference_batch(&self) -> Result<Vec<f32>> {
        let pairs: Vec<(Array3<f32>, Array3<f32>)> = self
            .pairs()
            .map(|(a, s)| (a.clone(), s.clone()))
            .collect();
        self.reference.predict_batch(&pairs)
    }

    /// Full-batch scores on the Candle backend
    pub fn candle_batch(&self) -> Result<Vec<f32>> {
        let scores = self
            .converted
            .forward_batch(&self.anchor_tensor, &self.sample_tensor)?;
        scores.flatten_all()?.to_vec1::<f32>().map_err(Into::into)
    }

    /// Run `repeats` batched inferences per backend and return items/second
    /// for (reference, candle).
    ///
    /// The rates are only meaningful as positivity checks; the two backends
    /// take different hardware paths and are not head-to-head comparable.
    pub fn measure_throughput(&self, repeats: usize) -> Result<(f64, f64)> {
        if repeats == 0 {
            bail!("Throughput measurement needs at least one repeat");
        }
        let items = (repeats * self.dataset_size()) as f64;

        let pairs: Vec<(Array3<f32>, Array3<f32>)> = self
            .pairs()
            .map(|(a, s)| (a.clone(), s.clone()))
            .collect();
        let start = Instant::now();
        for _ in 0..repeats {
            self.reference.predict_batch(&pairs)?;
        }
        let reference_rate = items / start.elapsed().as_secs_f64().max(1e-9);

        let start = Instant::now();
        for _ in 0..repeats {
            self.converted
                .forward_batch(&self.anchor_tensor, &self.sample_tensor)?;
        }
        // Accelerators queue work asynchronously; drain before reading the clock.
        self.converted.synchronize()?;
        let candle_rate = items / start.elapsed().as_secs_f64().max(1e-9);

        Ok((reference_rate, candle_rate))
    }

    /// Release backend state deterministically
    pub fn close(self) -> Result<()> {
        self.converted.release()
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.dataset_size() {
            bail!(
                "Pair index {index} out of range for dataset of {}",
                self.dataset_size()
            );
        }
        Ok(())
    }
}
