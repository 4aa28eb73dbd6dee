//! Interchange graph data model and (de)serialization
//!
//! A graph is a flat, topologically ordered list of nodes over named values,
//! plus embedded initializer tensors. Serialized as JSON so an export can be
//! inspected with ordinary tools.

use anyhow::{Context, Result};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// One axis of a declared input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dim {
    /// Variable-length axis identified by a symbol; all axes sharing a symbol
    /// must agree at run time
    Dynamic(String),
    /// Axis with a fixed extent
    Fixed(usize),
}

/// Declared graph input or output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Value name within the graph
    pub name: String,
    /// Per-axis extents
    pub dims: Vec<Dim>,
}

/// Embedded constant tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    /// Shape of the tensor
    pub dims: Vec<usize>,
    /// Row-major values
    pub values: Vec<f32>,
}

impl TensorData {
    /// Capture an ndarray in row-major order
    pub fn from_array(array: &ArrayD<f32>) -> Self {
        Self {
            dims: array.shape().to_vec(),
            values: array.iter().copied().collect(),
        }
    }

    /// Materialize the embedded tensor as an ndarray
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(self.dims.clone(), self.values.clone())
            .context("Initializer shape does not match its value count")
    }
}

/// Operation kinds expressible in the interchange format.
///
/// The enum is closed on purpose: a model using anything else must fail at
/// export time, never be silently skipped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// Valid-padding 2-D convolution over NCHW input; inputs are
    /// (value, weight, bias)
    Conv2d {
        /// Spatial stride on both axes
        stride: usize,
    },
    /// Element-wise max(x, 0)
    Relu,
    /// Collapse all axes after the batch axis
    Flatten,
    /// Affine map y = x Wᵀ + b; inputs are (value, weight, bias)
    Linear,
    /// Normalization with accumulated statistics; inputs are
    /// (value, scale, shift, mean, variance)
    BatchNorm {
        /// Stabilizing epsilon added to the variance
        eps: f32,
    },
    /// Element-wise subtraction of two equal-shape values
    Sub,
    /// Euclidean norm along axis 1, keeping the axis as extent 1
    L2Norm,
    /// Element-wise logistic function
    Sigmoid,
}

/// One computation step: named inputs in, one named output out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operation to apply
    pub op: Op,
    /// Names of consumed values (initializers or earlier outputs)
    pub inputs: Vec<String>,
    /// Name the result is bound to
    pub output: String,
}

/// A complete exported model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterchangeGraph {
    /// Declared inputs, bound positionally at run time
    pub inputs: Vec<TensorSpec>,
    /// Declared outputs, returned positionally
    pub outputs: Vec<TensorSpec>,
    /// Topologically ordered computation steps
    pub nodes: Vec<Node>,
    /// Embedded constants keyed by value name
    pub initializers: BTreeMap<String, TensorData>,
}

impl InterchangeGraph {
    /// Serialize to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Creating interchange graph file {path:?}"))?;
        serde_json::to_writer(BufWriter::new(file), self)
            .with_context(|| format!("Serializing interchange graph to {path:?}"))
    }

    /// Deserialize from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Opening interchange graph {path:?}"))?;
        serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Parsing interchange graph {path:?}"))
    }
}
