//! Export a Candle VerifyNet into the interchange graph format
//!
//! The exported graph declares "anchor" and "sample" inputs with a dynamic
//! batch axis and a single "score" output. Both embedding towers reference
//! the same initializers, mirroring the weight sharing of the in-memory
//! model. Anything the format cannot express aborts the export.

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::graph::{Dim, InterchangeGraph, Node, Op, TensorData, TensorSpec};
use crate::backend::candle::{param_prefixes, CandleVerifyNet};
use crate::backend::reference::{ReferenceVerifyNet, CONV_STRIDE};
use crate::backend::BN_EPS;

/// Symbol used for every variable-length batch axis
pub const BATCH_AXIS: &str = "batch";

/// Export `model` to `path`, validating against a representative NCHW input.
///
/// The representative input fixes the channel and spatial extents the graph
/// declares; its batch extent is irrelevant because the batch axis is
/// exported as dynamic. Export fails if the input does not fit the model or
/// the architecture cannot be expressed in the interchange ops.
pub fn export_matcher<P: AsRef<Path>>(
    model: &CandleVerifyNet,
    representative: &ArrayD<f32>,
    path: P,
) -> Result<()> {
    let path = path.as_ref();
    let graph = build_graph(model, representative)
        .with_context(|| format!("Exporting matcher to interchange graph {path:?}"))?;
    graph.save(path)?;
    info!(path = %path.display(), nodes = graph.nodes.len(), "exported interchange graph");
    Ok(())
}

fn build_graph(model: &CandleVerifyNet, representative: &ArrayD<f32>) -> Result<InterchangeGraph> {
    let shape = model.input_shape();
    if representative.ndim() != 4 {
        bail!(
            "Representative input must be NCHW rank 4, got shape {:?}",
            representative.shape()
        );
    }
    let dims = representative.shape();
    let (c, h, w) = (dims[1], dims[2], dims[3]);
    if (c, h, w) != (shape.channels, shape.rows, shape.cols) {
        bail!(
            "Representative input ({c}, {h}, {w}) does not match model input ({}, {}, {})",
            shape.channels,
            shape.rows,
            shape.cols
        );
    }
    // Shape inference: the embedding must survive two stride-2 valid
    // convolutions, otherwise the graph has no valid execution.
    ReferenceVerifyNet::flattened_dim(shape).context("Model is not expressible for export")?;

    let shapes = model.parameter_shapes();
    let values = model.parameter_values()?;
    let mut initializers = BTreeMap::new();
    for (name, dims) in &shapes {
        let data = values
            .get(name)
            .with_context(|| format!("Parameter {name:?} has a shape but no value"))?;
        initializers.insert(
            name.clone(),
            TensorData {
                dims: dims.clone(),
                values: data.clone(),
            },
        );
    }

    let mut nodes = Vec::new();
    for tower in ["anchor", "sample"] {
        nodes.extend(embedding_tower(tower));
    }
    nodes.push(Node {
        op: Op::Sub,
        inputs: vec!["anchor.embed".into(), "sample.embed".into()],
        output: "diff".into(),
    });
    nodes.push(Node {
        op: Op::L2Norm,
        inputs: vec!["diff".into()],
        output: "distance".into(),
    });
    nodes.push(Node {
        op: Op::BatchNorm { eps: BN_EPS as f32 },
        inputs: vec![
            "distance".into(),
            format!("{}.weight", param_prefixes::BN),
            format!("{}.bias", param_prefixes::BN),
            format!("{}.running_mean", param_prefixes::BN),
            format!("{}.running_var", param_prefixes::BN),
        ],
        output: "normalized".into(),
    });
    nodes.push(Node {
        op: Op::Linear,
        inputs: vec![
            "normalized".into(),
            format!("{}.weight", param_prefixes::FC),
            format!("{}.bias", param_prefixes::FC),
        ],
        output: "logits".into(),
    });
    nodes.push(Node {
        op: Op::Sigmoid,
        inputs: vec!["logits".into()],
        output: "score".into(),
    });

    let input_dims = vec![
        Dim::Dynamic(BATCH_AXIS.to_string()),
        Dim::Fixed(c),
        Dim::Fixed(h),
        Dim::Fixed(w),
    ];
    Ok(InterchangeGraph {
        inputs: vec![
            TensorSpec {
                name: "anchor".into(),
                dims: input_dims.clone(),
            },
            TensorSpec {
                name: "sample".into(),
                dims: input_dims,
            },
        ],
        outputs: vec![TensorSpec {
            name: "score".into(),
            dims: vec![Dim::Dynamic(BATCH_AXIS.to_string()), Dim::Fixed(1)],
        }],
        nodes,
        initializers,
    })
}

fn embedding_tower(tower: &str) -> Vec<Node> {
    vec![
        Node {
            op: Op::Conv2d {
                stride: CONV_STRIDE,
            },
            inputs: vec![
                tower.to_string(),
                format!("{}.weight", param_prefixes::CONV1),
                format!("{}.bias", param_prefixes::CONV1),
            ],
            output: format!("{tower}.conv1"),
        },
        Node {
            op: Op::Relu,
            inputs: vec![format!("{tower}.conv1")],
            output: format!("{tower}.relu1"),
        },
        Node {
            op: Op::Conv2d {
                stride: CONV_STRIDE,
            },
            inputs: vec![
                format!("{tower}.relu1"),
                format!("{}.weight", param_prefixes::CONV2),
                format!("{}.bias", param_prefixes::CONV2),
            ],
            output: format!("{tower}.conv2"),
        },
        Node {
            op: Op::Relu,
            inputs: vec![format!("{tower}.conv2")],
            output: format!("{tower}.relu2"),
        },
        Node {
            op: Op::Flatten,
            inputs: vec![format!("{tower}.relu2")],
            output: format!("{tower}.flat"),
        },
        Node {
            op: Op::Linear,
            inputs: vec![
                format!("{tower}.flat"),
                format!("{}.weight", param_prefixes::DENSE),
                format!("{}.bias", param_prefixes::DENSE),
            ],
            output: format!("{tower}.dense"),
        },
        Node {
            op: Op::Relu,
            inputs: vec![format!("{tower}.dense")],
            output: format!("{tower}.embed"),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InputShape;
    use candle_core::Device;
    use ndarray::Array;

    #[test]
    fn test_export_rejects_mismatched_representative() {
        let model = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        let wrong = Array::zeros(ndarray::IxDyn(&[1, 1, 9, 9]));
        let dir = tempfile::tempdir().unwrap();
        let err = export_matcher(&model, &wrong, dir.path().join("m.json")).unwrap_err();
        assert!(format!("{err:#}").contains("does not match"));
    }

    #[test]
    fn test_export_graph_shares_tower_weights() {
        let model = CandleVerifyNet::new_random(InputShape::new(8, 9), &Device::Cpu).unwrap();
        let representative = Array::zeros(ndarray::IxDyn(&[1, 1, 8, 9]));
        let graph = build_graph(&model, &representative).unwrap();
        // Twelve parameters embedded once, referenced by both towers.
        assert_eq!(graph.initializers.len(), 12);
        let conv1_refs = graph
            .nodes
            .iter()
            .filter(|n| n.inputs.iter().any(|i| i == "embedding.conv1.weight"))
            .count();
        assert_eq!(conv1_refs, 2);
        assert_eq!(graph.outputs[0].name, "score");
        assert_eq!(graph.outputs[0].dims[0], Dim::Dynamic("batch".into()));
    }
}
