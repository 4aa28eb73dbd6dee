//! Channel-last reference implementation of the VerifyNet matcher
//!
//! This backend mirrors the source framework's conventions exactly: inputs
//! are NHWC, convolution kernels are (kh, kw, in, out), dense kernels are
//! (in, out). It is the "source model" side of the weight converter and the
//! numerical ground truth for the parity harness.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use ndarray::{Array, Array1, Array2, Array3, Array4, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use std::collections::HashMap;
use std::path::Path;

use super::{InputShape, Matcher, BN_EPS};

/// Fully-qualified source layer names, in architecture construction order
pub mod layer_names {
    /// First embedding convolution
    pub const CONV1: &str = "siamese_matcher/embedding_network/conv2d";
    /// Second embedding convolution
    pub const CONV2: &str = "siamese_matcher/embedding_network/conv2d_1";
    /// Embedding projection
    pub const DENSE: &str = "siamese_matcher/embedding_network/dense";
    /// Distance normalization
    pub const BATCH_NORM: &str = "siamese_matcher/batch_normalization";
    /// Output head
    pub const OUTPUT: &str = "siamese_matcher/dense_1";
    /// Weightless regularization layers present in the source graph
    pub const DROPOUT1: &str = "siamese_matcher/embedding_network/dropout";
    /// Second dropout layer
    pub const DROPOUT2: &str = "siamese_matcher/embedding_network/dropout_1";
}

/// Convolution filter count in both embedding convolutions
pub const CONV_FILTERS: usize = 32;
/// Embedding dimensionality
pub const EMBEDDING_DIM: usize = 16;
/// Convolution kernel size
pub const KERNEL_SIZE: usize = 3;
/// Convolution stride
pub const CONV_STRIDE: usize = 2;

/// Initialization scale for seeded random weights
const INIT_STD: f32 = 0.05;

fn conv_out(dim: usize) -> usize {
    (dim - KERNEL_SIZE) / CONV_STRIDE + 1
}

/// Valid-padding NHWC convolution layer
struct RefConv2d {
    /// Kernel in (kh, kw, in_channels, out_channels) layout
    kernel: Array4<f32>,
    bias: Array1<f32>,
}

impl RefConv2d {
    fn forward(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let (n, h, w, cin) = input.dim();
        let (kh, kw, kcin, cout) = self.kernel.dim();
        if cin != kcin {
            bail!("Convolution channel mismatch: input has {cin}, kernel expects {kcin}");
        }
        if h < kh || w < kw {
            bail!("Convolution input ({h}x{w}) smaller than kernel ({kh}x{kw})");
        }
        let oh = (h - kh) / CONV_STRIDE + 1;
        let ow = (w - kw) / CONV_STRIDE + 1;
        let mut out = Array4::<f32>::zeros((n, oh, ow, cout));
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    for oc in 0..cout {
                        let mut acc = self.bias[oc];
                        for ky in 0..kh {
                            for kx in 0..kw {
                                for ic in 0..cin {
                                    acc += input[[b, oy * CONV_STRIDE + ky, ox * CONV_STRIDE + kx, ic]]
                                        * self.kernel[[ky, kx, ic, oc]];
                                }
                            }
                        }
                        out[[b, oy, ox, oc]] = acc;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Dense layer with (in, out) kernel layout
struct RefDense {
    kernel: Array2<f32>,
    bias: Array1<f32>,
}

impl RefDense {
    fn forward(&self, input: &Array2<f32>) -> Result<Array2<f32>> {
        let (_, features) = input.dim();
        let (kin, _) = self.kernel.dim();
        if features != kin {
            bail!("Dense input mismatch: got {features} features, kernel expects {kin}");
        }
        Ok(input.dot(&self.kernel) + &self.bias)
    }
}

/// Batch normalization applied with accumulated statistics (inference mode)
struct RefBatchNorm {
    gamma: Array1<f32>,
    beta: Array1<f32>,
    mean: Array1<f32>,
    variance: Array1<f32>,
}

impl RefBatchNorm {
    fn forward(&self, input: &Array1<f32>) -> Array1<f32> {
        let scale = self.gamma[0] / (self.variance[0] + BN_EPS as f32).sqrt();
        input.mapv(|v| (v - self.mean[0]) * scale + self.beta[0])
    }
}

fn relu4(x: Array4<f32>) -> Array4<f32> {
    x.mapv(|v| v.max(0.0))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// The source-framework VerifyNet: twin embedding towers, L2 distance,
/// normalized and squashed into a match score.
pub struct ReferenceVerifyNet {
    input_shape: InputShape,
    embedding_inputs: usize,
    conv1: RefConv2d,
    conv2: RefConv2d,
    dense: RefDense,
    bn: RefBatchNorm,
    fc: RefDense,
}

impl ReferenceVerifyNet {
    /// Number of features entering the embedding projection for a given input shape
    pub fn flattened_dim(shape: InputShape) -> Result<usize> {
        if shape.rows < 7 || shape.cols < 7 {
            bail!(
                "Input shape {}x{} too small: two stride-2 valid convolutions need at least 7x7",
                shape.rows,
                shape.cols
            );
        }
        let h = conv_out(conv_out(shape.rows));
        let w = conv_out(conv_out(shape.cols));
        Ok(h * w * CONV_FILTERS)
    }

    /// Build with deterministic random weights drawn from `rng`.
    ///
    /// Draw order matches the source framework's weight enumeration order so
    /// the same rng stream reproduces the same model: conv kernels/biases,
    /// dense kernel/bias, normalization statistics, output head.
    pub fn from_rng(shape: InputShape, rng: &mut StdRng) -> Result<Self> {
        let flat = Self::flattened_dim(shape)?;
        let normal = |rng: &mut StdRng, len: usize| -> Vec<f32> {
            (0..len)
                .map(|_| rng.sample::<f32, _>(StandardNormal) * INIT_STD)
                .collect()
        };

        let k1 = (KERNEL_SIZE, KERNEL_SIZE, shape.channels, CONV_FILTERS);
        let conv1 = RefConv2d {
            kernel: Array4::from_shape_vec(k1, normal(rng, KERNEL_SIZE * KERNEL_SIZE * shape.channels * CONV_FILTERS))?,
            bias: Array1::from_vec(normal(rng, CONV_FILTERS)),
        };
        let k2 = (KERNEL_SIZE, KERNEL_SIZE, CONV_FILTERS, CONV_FILTERS);
        let conv2 = RefConv2d {
            kernel: Array4::from_shape_vec(k2, normal(rng, KERNEL_SIZE * KERNEL_SIZE * CONV_FILTERS * CONV_FILTERS))?,
            bias: Array1::from_vec(normal(rng, CONV_FILTERS)),
        };
        let dense = RefDense {
            kernel: Array2::from_shape_vec((flat, EMBEDDING_DIM), normal(rng, flat * EMBEDDING_DIM))?,
            bias: Array1::from_vec(normal(rng, EMBEDDING_DIM)),
        };
        // Normalization statistics: scale stays near one and the accumulated
        // variance must be strictly positive.
        let bn = RefBatchNorm {
            gamma: Array1::from_vec(vec![1.0 + rng.sample::<f32, _>(StandardNormal) * INIT_STD]),
            beta: Array1::from_vec(normal(rng, 1)),
            mean: Array1::from_vec(normal(rng, 1)),
            variance: Array1::from_vec(vec![rng.gen_range(0.5..1.5)]),
        };
        let fc = RefDense {
            kernel: Array2::from_shape_vec((1, 1), normal(rng, 1))?,
            bias: Array1::from_vec(normal(rng, 1)),
        };

        Ok(Self {
            input_shape: shape,
            embedding_inputs: flat,
            conv1,
            conv2,
            dense,
            bn,
            fc,
        })
    }

    /// Input geometry the model was built for
    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    /// Raw weight list of a named layer, in source-framework enumeration order.
    ///
    /// Returns `Some(vec![])` for known weightless layers (dropout) and `None`
    /// for names that do not exist in this architecture.
    pub fn layer_weights(&self, name: &str) -> Option<Vec<ArrayD<f32>>> {
        use layer_names::*;
        match name {
            CONV1 => Some(vec![
                self.conv1.kernel.clone().into_dyn(),
                self.conv1.bias.clone().into_dyn(),
            ]),
            CONV2 => Some(vec![
                self.conv2.kernel.clone().into_dyn(),
                self.conv2.bias.clone().into_dyn(),
            ]),
            DENSE => Some(vec![
                self.dense.kernel.clone().into_dyn(),
                self.dense.bias.clone().into_dyn(),
            ]),
            BATCH_NORM => Some(vec![
                self.bn.gamma.clone().into_dyn(),
                self.bn.beta.clone().into_dyn(),
                self.bn.mean.clone().into_dyn(),
                self.bn.variance.clone().into_dyn(),
            ]),
            OUTPUT => Some(vec![
                self.fc.kernel.clone().into_dyn(),
                self.fc.bias.clone().into_dyn(),
            ]),
            DROPOUT1 | DROPOUT2 => Some(vec![]),
            _ => None,
        }
    }

    fn embed(&self, input: &Array4<f32>) -> Result<Array2<f32>> {
        let n = input.dim().0;
        let x = relu4(self.conv1.forward(input)?);
        let x = relu4(self.conv2.forward(&x)?);
        let x = x
            .into_shape((n, self.embedding_inputs))
            .context("Flattening embedding features")?;
        let x = self.dense.forward(&x)?;
        Ok(x.mapv(|v| v.max(0.0)))
    }

    fn forward(&self, anchors: &Array4<f32>, samples: &Array4<f32>) -> Result<Array1<f32>> {
        if anchors.dim() != samples.dim() {
            bail!(
                "Anchor batch {:?} and sample batch {:?} disagree",
                anchors.dim(),
                samples.dim()
            );
        }
        let expected = (
            self.input_shape.rows,
            self.input_shape.cols,
            self.input_shape.channels,
        );
        let (_, h, w, c) = anchors.dim();
        if (h, w, c) != expected {
            bail!("Input shape ({h}, {w}, {c}) does not match model input {expected:?}");
        }
        let anchor_embed = self.embed(anchors)?;
        let sample_embed = self.embed(samples)?;
        let diff = &anchor_embed - &sample_embed;
        let distance = diff
            .mapv(|v| v * v)
            .sum_axis(Axis(1))
            .mapv(f32::sqrt);
        let normalized = self.bn.forward(&distance);
        let logits = normalized.mapv(|v| v * self.fc.kernel[[0, 0]] + self.fc.bias[0]);
        Ok(logits.mapv(sigmoid))
    }

    /// Score one anchor/sample pair
    pub fn predict(&self, anchor: &Array3<f32>, sample: &Array3<f32>) -> Result<f32> {
        let pair = [(anchor.clone(), sample.clone())];
        let scores = self.predict_batch(&pair)?;
        Ok(scores[0])
    }

    /// Score a batch of pairs, results paired by index
    pub fn predict_batch(&self, pairs: &[(Array3<f32>, Array3<f32>)]) -> Result<Vec<f32>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let (h, w, c) = pairs[0].0.dim();
        let mut anchors = Array4::<f32>::zeros((pairs.len(), h, w, c));
        let mut samples = Array4::<f32>::zeros((pairs.len(), h, w, c));
        for (i, (anchor, sample)) in pairs.iter().enumerate() {
            if anchor.dim() != (h, w, c) || sample.dim() != (h, w, c) {
                bail!("Pair {i} has inconsistent shape");
            }
            anchors.index_axis_mut(Axis(0), i).assign(anchor);
            samples.index_axis_mut(Axis(0), i).assign(sample);
        }
        Ok(self.forward(&anchors, &samples)?.to_vec())
    }

    /// Persist the model's weights with source-framework key names
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        for name in [
            layer_names::CONV1,
            layer_names::CONV2,
            layer_names::DENSE,
            layer_names::BATCH_NORM,
            layer_names::OUTPUT,
        ] {
            let weights = self
                .layer_weights(name)
                .with_context(|| format!("Layer {name} missing from model"))?;
            for (suffix, array) in storage_suffixes(name, weights.len())?.iter().zip(weights) {
                tensors.insert(format!("{name}/{suffix}"), array_to_tensor(&array)?);
            }
        }
        candle_core::safetensors::save(&tensors, path.as_ref())
            .with_context(|| format!("Saving reference weights to {:?}", path.as_ref()))
    }

    /// Load a model persisted by [`Self::save_safetensors`]
    pub fn from_safetensors<P: AsRef<Path>>(path: P, shape: InputShape) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Loading reference weights from {path:?}"))?;
        let fetch = |name: &str, suffix: &str| -> Result<ArrayD<f32>> {
            let key = format!("{name}/{suffix}");
            let tensor = tensors
                .get(&key)
                .with_context(|| format!("Weight {key:?} missing from {path:?}"))?;
            tensor_to_array(tensor)
        };

        use layer_names::*;
        let flat = Self::flattened_dim(shape)?;
        let model = Self {
            input_shape: shape,
            embedding_inputs: flat,
            conv1: RefConv2d {
                kernel: fetch(CONV1, "kernel")?
                    .into_dimensionality()
                    .context("conv2d kernel must be rank 4")?,
                bias: fetch(CONV1, "bias")?
                    .into_dimensionality()
                    .context("conv2d bias must be rank 1")?,
            },
            conv2: RefConv2d {
                kernel: fetch(CONV2, "kernel")?
                    .into_dimensionality()
                    .context("conv2d_1 kernel must be rank 4")?,
                bias: fetch(CONV2, "bias")?
                    .into_dimensionality()
                    .context("conv2d_1 bias must be rank 1")?,
            },
            dense: RefDense {
                kernel: fetch(DENSE, "kernel")?
                    .into_dimensionality()
                    .context("dense kernel must be rank 2")?,
                bias: fetch(DENSE, "bias")?
                    .into_dimensionality()
                    .context("dense bias must be rank 1")?,
            },
            bn: RefBatchNorm {
                gamma: fetch(BATCH_NORM, "gamma")?
                    .into_dimensionality()
                    .context("gamma must be rank 1")?,
                beta: fetch(BATCH_NORM, "beta")?
                    .into_dimensionality()
                    .context("beta must be rank 1")?,
                mean: fetch(BATCH_NORM, "moving_mean")?
                    .into_dimensionality()
                    .context("moving_mean must be rank 1")?,
                variance: fetch(BATCH_NORM, "moving_variance")?
                    .into_dimensionality()
                    .context("moving_variance must be rank 1")?,
            },
            fc: RefDense {
                kernel: fetch(OUTPUT, "kernel")?
                    .into_dimensionality()
                    .context("dense_1 kernel must be rank 2")?,
                bias: fetch(OUTPUT, "bias")?
                    .into_dimensionality()
                    .context("dense_1 bias must be rank 1")?,
            },
        };
        let (kin, _) = model.dense.kernel.dim();
        if kin != flat {
            bail!(
                "Dense kernel expects {kin} inputs but input shape {}x{} flattens to {flat}",
                shape.rows,
                shape.cols
            );
        }
        Ok(model)
    }
}

fn storage_suffixes(name: &str, count: usize) -> Result<&'static [&'static str]> {
    match count {
        2 => Ok(&["kernel", "bias"]),
        4 => Ok(&["gamma", "beta", "moving_mean", "moving_variance"]),
        other => bail!("Layer {name} has an unexpected weight count {other}"),
    }
}

/// Copy an ndarray into a CPU candle tensor
pub fn array_to_tensor(array: &ArrayD<f32>) -> Result<candle_core::Tensor> {
    let data: Vec<f32> = array.iter().copied().collect();
    candle_core::Tensor::from_vec(data, array.shape(), &Device::Cpu).map_err(Into::into)
}

/// Copy a candle tensor into an owned ndarray
pub fn tensor_to_array(tensor: &candle_core::Tensor) -> Result<ArrayD<f32>> {
    let dims = tensor.dims().to_vec();
    let data = tensor.flatten_all()?.to_vec1::<f32>()?;
    Array::from_shape_vec(IxDyn(&dims), data).map_err(Into::into)
}

impl Matcher for ReferenceVerifyNet {
    fn verify(&self, anchor: &Array3<f32>, sample: &Array3<f32>) -> Result<f32> {
        self.predict(anchor, sample)
    }

    fn verify_batch(&self, pairs: &[(Array3<f32>, Array3<f32>)]) -> Result<Vec<f32>> {
        self.predict_batch(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn model() -> ReferenceVerifyNet {
        let mut rng = StdRng::seed_from_u64(7);
        ReferenceVerifyNet::from_rng(InputShape::new(8, 9), &mut rng).unwrap()
    }

    #[test]
    fn test_flattened_dim() {
        // 8 -> 3 -> 1 rows, 9 -> 4 -> 1 cols, 32 filters
        assert_eq!(
            ReferenceVerifyNet::flattened_dim(InputShape::new(8, 9)).unwrap(),
            32
        );
        // 64 -> 31 -> 15 on both axes
        assert_eq!(
            ReferenceVerifyNet::flattened_dim(InputShape::new(64, 64)).unwrap(),
            15 * 15 * 32
        );
        assert!(ReferenceVerifyNet::flattened_dim(InputShape::new(4, 9)).is_err());
    }

    #[test]
    fn test_conv_identity_kernel() {
        // A single 1-filter kernel with one hot weight passes the corner pixel through.
        let mut kernel = Array4::<f32>::zeros((3, 3, 1, 1));
        kernel[[0, 0, 0, 0]] = 1.0;
        let conv = RefConv2d {
            kernel,
            bias: Array1::zeros(1),
        };
        let mut input = Array4::<f32>::zeros((1, 5, 5, 1));
        input[[0, 0, 0, 0]] = 3.5;
        input[[0, 2, 2, 0]] = -1.25;
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.dim(), (1, 2, 2, 1));
        assert_eq!(out[[0, 0, 0, 0]], 3.5);
        assert_eq!(out[[0, 1, 1, 0]], -1.25);
    }

    #[test]
    fn test_layer_weights_enumeration() {
        let model = model();
        let conv = model.layer_weights(layer_names::CONV1).unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].shape(), &[3, 3, 1, 32]);
        let bn = model.layer_weights(layer_names::BATCH_NORM).unwrap();
        assert_eq!(bn.len(), 4);
        assert!(model.layer_weights(layer_names::DROPOUT1).unwrap().is_empty());
        assert!(model.layer_weights("siamese_matcher/nope").is_none());
    }

    #[test]
    fn test_predict_scores_in_unit_interval() {
        let model = model();
        let anchor = Array3::<f32>::from_elem((8, 9, 1), 0.5);
        let sample = Array3::<f32>::from_elem((8, 9, 1), -0.5);
        let score = model.predict(&anchor, &sample).unwrap();
        assert!(score > 0.0 && score < 1.0);
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let model = model();
        let anchor = Array3::<f32>::zeros((9, 9, 1));
        let err = model.predict(&anchor, &anchor).unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn test_safetensors_round_trip() {
        let model = model();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verify_net.safetensors");
        model.save_safetensors(&path).unwrap();
        let reloaded =
            ReferenceVerifyNet::from_safetensors(&path, InputShape::new(8, 9)).unwrap();

        let anchor = Array3::<f32>::from_elem((8, 9, 1), 0.25);
        let sample = Array3::<f32>::from_elem((8, 9, 1), 0.75);
        let before = model.predict(&anchor, &sample).unwrap();
        let after = reloaded.predict(&anchor, &sample).unwrap();
        assert_eq!(before, after);
    }
}
