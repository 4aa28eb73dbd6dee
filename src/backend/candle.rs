//! Channel-first Candle implementation of the VerifyNet matcher
//!
//! The destination side of the weight converter. Parameters live in a
//! [`VarMap`] so the converter can inspect every expected parameter name and
//! shape, and commit a fully validated dictionary in one step.

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{
    batch_norm, conv2d, linear, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, Module,
    ModuleT, VarBuilder, VarMap,
};
use ndarray::Array3;
use std::collections::HashMap;
use std::path::Path;

use super::reference::{ReferenceVerifyNet, CONV_FILTERS, CONV_STRIDE, EMBEDDING_DIM, KERNEL_SIZE};
use super::{InputShape, Matcher, BN_EPS};

/// Destination parameter-name prefixes, in architecture construction order
pub mod param_prefixes {
    /// First embedding convolution
    pub const CONV1: &str = "embedding.conv1";
    /// Second embedding convolution
    pub const CONV2: &str = "embedding.conv2";
    /// Embedding projection
    pub const DENSE: &str = "embedding.dense";
    /// Distance normalization
    pub const BN: &str = "bn";
    /// Output head
    pub const FC: &str = "fc";
}

/// Siamese VerifyNet on Candle: twin embedding towers with shared weights,
/// L2 distance, batch-norm, linear head, sigmoid.
struct SiameseMatcher {
    conv1: Conv2d,
    conv2: Conv2d,
    dense: Linear,
    bn: BatchNorm,
    fc: Linear,
}

impl SiameseMatcher {
    fn new(shape: InputShape, vb: VarBuilder) -> Result<Self> {
        let flattened = ReferenceVerifyNet::flattened_dim(shape)?;
        let conv_cfg = Conv2dConfig {
            stride: CONV_STRIDE,
            ..Default::default()
        };
        let embedding = vb.pp("embedding");
        let conv1 = conv2d(
            shape.channels,
            CONV_FILTERS,
            KERNEL_SIZE,
            conv_cfg,
            embedding.pp("conv1"),
        )?;
        let conv2 = conv2d(
            CONV_FILTERS,
            CONV_FILTERS,
            KERNEL_SIZE,
            conv_cfg,
            embedding.pp("conv2"),
        )?;
        let dense = linear(flattened, EMBEDDING_DIM, embedding.pp("dense"))?;
        let bn_cfg = BatchNormConfig {
            eps: BN_EPS,
            ..Default::default()
        };
        let bn = batch_norm(1, bn_cfg, vb.pp("bn"))?;
        let fc = linear(1, 1, vb.pp("fc"))?;
        Ok(Self {
            conv1,
            conv2,
            dense,
            bn,
            fc,
        })
    }

    fn embed(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let x = x.flatten_from(1)?;
        self.dense.forward(&x)?.relu().map_err(Into::into)
    }

    /// Inference-mode forward pass over NCHW batches; returns (batch, 1) scores.
    fn forward(&self, anchors: &Tensor, samples: &Tensor) -> Result<Tensor> {
        let anchor_embed = self.embed(anchors)?;
        let sample_embed = self.embed(samples)?;
        let distance = (anchor_embed - sample_embed)?
            .sqr()?
            .sum_keepdim(1)?
            .sqrt()?;
        let normalized = self.bn.forward_t(&distance, false)?;
        let logits = self.fc.forward(&normalized)?;
        candle_nn::ops::sigmoid(&logits).map_err(Into::into)
    }
}

/// Handle around the Candle VerifyNet and its parameter dictionary
pub struct CandleVerifyNet {
    model: SiameseMatcher,
    varmap: VarMap,
    device: Device,
    input_shape: InputShape,
}

impl CandleVerifyNet {
    /// Build with Candle's default random initialization
    pub fn new_random(shape: InputShape, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = SiameseMatcher::new(shape, vb)?;
        Ok(Self {
            model,
            varmap,
            device: device.clone(),
            input_shape: shape,
        })
    }

    /// Build and load previously converted weights from a safetensors file
    pub fn load<P: AsRef<Path>>(path: P, shape: InputShape, device: &Device) -> Result<Self> {
        let mut net = Self::new_random(shape, device)?;
        net.varmap
            .load(path.as_ref())
            .with_context(|| format!("Loading converted weights from {:?}", path.as_ref()))?;
        Ok(net)
    }

    /// Persist the committed parameter dictionary
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap
            .save(path.as_ref())
            .with_context(|| format!("Saving converted weights to {:?}", path.as_ref()))
    }

    /// Input geometry the model was built for
    pub fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    /// Device the parameters live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Expected shape of every parameter in the dictionary
    pub fn parameter_shapes(&self) -> HashMap<String, Vec<usize>> {
        let data = self.varmap.data().lock().unwrap();
        data.iter()
            .map(|(name, var)| (name.clone(), var.dims().to_vec()))
            .collect()
    }

    /// Current value of every parameter, flattened; used to observe whether a
    /// failed conversion touched the model
    pub fn parameter_values(&self) -> Result<HashMap<String, Vec<f32>>> {
        let data = self.varmap.data().lock().unwrap();
        let mut values = HashMap::new();
        for (name, var) in data.iter() {
            values.insert(name.clone(), var.flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(values)
    }

    /// Commit a fully staged parameter dictionary.
    ///
    /// Validation happens before any write: an unknown key, a shape mismatch,
    /// or a destination parameter left uncovered aborts with the model
    /// untouched. Only after everything checks out are the variables set.
    pub fn commit(&self, staged: &HashMap<String, Tensor>) -> Result<()> {
        let data = self.varmap.data().lock().unwrap();
        for (name, tensor) in staged {
            let var = data.get(name).with_context(|| {
                format!("Converted parameter {name:?} does not exist in the destination model")
            })?;
            if var.dims() != tensor.dims() {
                bail!(
                    "Shape mismatch for parameter {name:?}: destination expects {:?}, conversion produced {:?}",
                    var.dims(),
                    tensor.dims()
                );
            }
        }
        for name in data.keys() {
            if !staged.contains_key(name) {
                bail!("Destination parameter {name:?} is not covered by the layer mapping");
            }
        }
        for (name, tensor) in staged {
            if let Some(var) = data.get(name) {
                var.set(tensor)
                    .with_context(|| format!("Writing parameter {name:?}"))?;
            }
        }
        Ok(())
    }

    /// Stack channel-last host arrays into an NCHW device tensor
    pub fn prepare_batch(&self, arrays: &[Array3<f32>]) -> Result<Tensor> {
        if arrays.is_empty() {
            bail!("Cannot prepare an empty batch");
        }
        let (h, w, c) = arrays[0].dim();
        let mut data = Vec::with_capacity(arrays.len() * h * w * c);
        for (i, array) in arrays.iter().enumerate() {
            if array.dim() != (h, w, c) {
                bail!("Batch element {i} has inconsistent shape");
            }
            data.extend(array.iter().copied());
        }
        let nhwc = Tensor::from_vec(data, (arrays.len(), h, w, c), &self.device)?;
        nhwc.permute((0, 3, 1, 2))?.contiguous().map_err(Into::into)
    }

    /// Run the matcher over prepared NCHW tensors; returns (batch, 1) scores
    pub fn forward_batch(&self, anchors: &Tensor, samples: &Tensor) -> Result<Tensor> {
        self.model.forward(anchors, samples)
    }

    /// Score one anchor/sample pair from channel-last host arrays
    pub fn predict(&self, anchor: &Array3<f32>, sample: &Array3<f32>) -> Result<f32> {
        let anchors = self.prepare_batch(std::slice::from_ref(anchor))?;
        let samples = self.prepare_batch(std::slice::from_ref(sample))?;
        let scores = self.model.forward(&anchors, &samples)?;
        Ok(scores.flatten_all()?.to_vec1::<f32>()?[0])
    }

    /// Score a batch of pairs, results paired by index
    pub fn predict_batch(&self, pairs: &[(Array3<f32>, Array3<f32>)]) -> Result<Vec<f32>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let anchors: Vec<Array3<f32>> = pairs.iter().map(|(a, _)| a.clone()).collect();
        let samples: Vec<Array3<f32>> = pairs.iter().map(|(_, s)| s.clone()).collect();
        let anchor_tensor = self.prepare_batch(&anchors)?;
        let sample_tensor = self.prepare_batch(&samples)?;
        let scores = self.model.forward(&anchor_tensor, &sample_tensor)?;
        scores.flatten_all()?.to_vec1::<f32>().map_err(Into::into)
    }

    /// Wait for in-flight device work; a no-op on the CPU
    pub fn synchronize(&self) -> Result<()> {
        match &self.device {
            Device::Cpu => Ok(()),
            device => device.synchronize().map_err(Into::into),
        }
    }

    /// Explicit teardown: drain device work and drop the parameter state
    pub fn release(self) -> Result<()> {
        self.synchronize()
    }
}

impl Matcher for CandleVerifyNet {
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

    #[test]
    fn test_parameter_shapes() {
        let net = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        let shapes = net.parameter_shapes();
        assert_eq!(shapes["embedding.conv1.weight"], vec![32, 1, 3, 3]);
        assert_eq!(shapes["embedding.conv2.weight"], vec![32, 32, 3, 3]);
        assert_eq!(shapes["embedding.dense.weight"], vec![16, 32]);
        assert_eq!(shapes["bn.running_mean"], vec![1]);
        assert_eq!(shapes["bn.running_var"], vec![1]);
        assert_eq!(shapes["fc.weight"], vec![1, 1]);
        assert_eq!(shapes["fc.bias"], vec![1]);
        assert_eq!(shapes.len(), 12);
    }

    #[test]
    fn test_commit_rejects_unknown_key() {
        let net = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        let mut staged = HashMap::new();
        staged.insert(
            "nonexistent.weight".to_string(),
            Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = net.commit(&staged).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_commit_rejects_missing_coverage() {
        let net = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        // Stage a single valid parameter; commit must refuse because the rest
        // of the dictionary is uncovered, and must not write anything.
        let before = net.parameter_values().unwrap();
        let mut staged = HashMap::new();
        staged.insert(
            "fc.bias".to_string(),
            Tensor::zeros((1,), DType::F32, &Device::Cpu).unwrap(),
        );
        let err = net.commit(&staged).unwrap_err();
        assert!(err.to_string().contains("not covered"));
        assert_eq!(net.parameter_values().unwrap(), before);
    }

    #[test]
    fn test_predict_batch_matches_single() {
        let net = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        let anchor = Array3::<f32>::from_elem((8, 9, 1), 0.3);
        let sample = Array3::<f32>::from_elem((8, 9, 1), -0.2);
        let single = net.predict(&anchor, &sample).unwrap();
        let batch = net
            .predict_batch(&[(anchor.clone(), sample.clone()), (sample, anchor)])
            .unwrap();
        assert!((batch[0] - single).abs() < 1e-6);
    }
}
