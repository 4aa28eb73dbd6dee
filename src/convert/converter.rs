//! Weight converter: mapping-driven, fail-fast, atomic
//!
//! For each descriptor the converter fetches the source layer's raw weights,
//! dispatches on the declared kind, stages the transformed tensors under the
//! destination parameter names, and finally commits the whole dictionary in
//! one validated step. Any failure leaves the destination model untouched.

use anyhow::{bail, Context, Result};
use candle_core::Tensor;
use ndarray::ArrayD;
use std::collections::HashMap;
use tracing::debug;

use super::layout;
use super::mapping::{verify_net_mapping, LayerDescriptor, LayerKind};
use crate::backend::candle::CandleVerifyNet;
use crate::backend::reference::{array_to_tensor, ReferenceVerifyNet};

/// A model the converter can read raw per-layer weights from
pub trait WeightSource {
    /// Raw weight list of a named layer in source enumeration order.
    ///
    /// `Some(vec![])` marks a known weightless layer (benign skip); `None`
    /// marks a name absent from the architecture (a mapping bug).
    fn layer_weights(&self, name: &str) -> Option<Vec<ArrayD<f32>>>;
}

impl WeightSource for ReferenceVerifyNet {
    fn layer_weights(&self, name: &str) -> Option<Vec<ArrayD<f32>>> {
        ReferenceVerifyNet::layer_weights(self, name)
    }
}

/// Convert using the static VerifyNet mapping.
///
/// On success the destination's parameters are overwritten in place; on any
/// error they are exactly as before the call.
pub fn convert<S: WeightSource>(source: &S, destination: &CandleVerifyNet) -> Result<()> {
    convert_with_mapping(source, destination, verify_net_mapping())
}

/// Convert with an explicit mapping; the static table is the production path,
/// an explicit table lets tests inject broken descriptors.
pub fn convert_with_mapping<S: WeightSource>(
    source: &S,
    destination: &CandleVerifyNet,
    descriptors: &[LayerDescriptor],
) -> Result<()> {
    let mut staged: HashMap<String, Tensor> = HashMap::new();
    for descriptor in descriptors {
        let weights = source
            .layer_weights(descriptor.source_name)
            .with_context(|| {
                format!(
                    "Source model has no layer named {:?}",
                    descriptor.source_name
                )
            })?;
        if weights.is_empty() {
            debug!(layer = descriptor.source_name, "skipping weightless layer");
            continue;
        }
        let converted = convert_layer(descriptor, &weights)?;
        for (name, array) in converted {
            let tensor = stage_tensor(&array, destination)?;
            if staged.insert(name.clone(), tensor).is_some() {
                bail!(
                    "Destination parameter {name:?} written twice; mapping entry {:?} collides with an earlier layer",
                    descriptor.source_name
                );
            }
        }
        debug!(
            layer = descriptor.source_name,
            prefix = descriptor.destination_prefix,
            "converted layer"
        );
    }
    destination.commit(&staged)
}

/// Transform one layer's raw weights into named destination tensors
fn convert_layer(
    descriptor: &LayerDescriptor,
    weights: &[ArrayD<f32>],
) -> Result<Vec<(String, ArrayD<f32>)>> {
    let prefix = descriptor.destination_prefix;
    match descriptor.kind {
        LayerKind::Convolutional => {
            expect_count(descriptor, weights, 2)?;
            let kernel = layout::convolutional_kernel(&weights[0])
                .with_context(|| format!("Converting layer {:?}", descriptor.source_name))?;
            Ok(vec![
                (format!("{prefix}.weight"), kernel),
                (format!("{prefix}.bias"), weights[1].clone()),
            ])
        }
        LayerKind::Dense => {
            expect_count(descriptor, weights, 2)?;
            let kernel = layout::dense_kernel(&weights[0])
                .with_context(|| format!("Converting layer {:?}", descriptor.source_name))?;
            Ok(vec![
                (format!("{prefix}.weight"), kernel),
                (format!("{prefix}.bias"), weights[1].clone()),
            ])
        }
        LayerKind::Normalization => {
            expect_count(descriptor, weights, 4)?;
            let suffixes = ["weight", "bias", "running_mean", "running_var"];
            let mut out = Vec::with_capacity(4);
            for (suffix, stats) in suffixes.iter().zip(weights) {
                let vector = layout::normalization_vector(stats)
                    .with_context(|| format!("Converting layer {:?}", descriptor.source_name))?;
                out.push((format!("{prefix}.{suffix}"), vector));
            }
            Ok(out)
        }
    }
}

fn expect_count(descriptor: &LayerDescriptor, weights: &[ArrayD<f32>], count: usize) -> Result<()> {
    if weights.len() != count {
        bail!(
            "Unsupported layer {:?}: declared {:?} expects {count} weight tensors, source provided {}",
            descriptor.source_name,
            descriptor.kind,
            weights.len()
        );
    }
    Ok(())
}

fn stage_tensor(array: &ArrayD<f32>, destination: &CandleVerifyNet) -> Result<Tensor> {
    // to_device is a no-op clone when the destination already lives on the CPU
    array_to_tensor(array)?
        .to_device(destination.device())
        .map_err(Into::into)
}
