//! Independent execution engine for interchange graphs
//!
//! Runs an exported graph with its own ndarray kernels; it shares no code
//! with the Candle backend, which is what makes a round-trip comparison
//! meaningful. Inputs bind positionally; fixed axes must match exactly and
//! every axis bound to the same dynamic symbol must agree.

use anyhow::{bail, Context, Result};
use ndarray::{Array4, ArrayD, Axis};
use std::collections::HashMap;
use std::path::Path;

use super::graph::{Dim, InterchangeGraph, Node, Op};

/// A loaded interchange graph ready to execute
pub struct InterchangeSession {
    graph: InterchangeGraph,
}

impl InterchangeSession {
    /// Load a graph exported by [`super::export_matcher`]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            graph: InterchangeGraph::load(path)?,
        })
    }

    /// Wrap an in-memory graph
    pub fn from_graph(graph: InterchangeGraph) -> Self {
        Self { graph }
    }

    /// Declared input names in binding order
    pub fn input_names(&self) -> Vec<&str> {
        self.graph.inputs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Execute the graph; `inputs` bind positionally to the declared inputs
    /// and outputs come back in declared order.
    pub fn run(&self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>> {
        if inputs.len() != self.graph.inputs.len() {
            bail!(
                "Graph declares {} inputs, got {}",
                self.graph.inputs.len(),
                inputs.len()
            );
        }

        let mut symbols: HashMap<&str, usize> = HashMap::new();
        let mut env: HashMap<String, ArrayD<f32>> = HashMap::new();
        for (name, data) in &self.graph.initializers {
            env.insert(name.clone(), data.to_array()?);
        }
        for (spec, array) in self.graph.inputs.iter().zip(inputs) {
            if array.ndim() != spec.dims.len() {
                bail!(
                    "Input {:?} must be rank {}, got shape {:?}",
                    spec.name,
                    spec.dims.len(),
                    array.shape()
                );
            }
            for (axis, (dim, &extent)) in spec.dims.iter().zip(array.shape()).enumerate() {
                match dim {
                    Dim::Fixed(expected) => {
                        if extent != *expected {
                            bail!(
                                "Input {:?} axis {axis} must be {expected}, got {extent}",
                                spec.name
                            );
                        }
                    }
                    Dim::Dynamic(symbol) => {
                        let bound = symbols.entry(symbol.as_str()).or_insert(extent);
                        if *bound != extent {
                            bail!(
                                "Dynamic axis {symbol:?} bound to {bound} elsewhere, got {extent} on input {:?}",
                                spec.name
                            );
                        }
                    }
                }
            }
            env.insert(spec.name.clone(), array.clone());
        }

        for node in &self.graph.nodes {
            let result = eval_node(node, &env)
                .with_context(|| format!("Evaluating node producing {:?}", node.output))?;
            if env.insert(node.output.clone(), result).is_some() {
                bail!("Value {:?} defined more than once", node.output);
            }
        }

        let mut outputs = Vec::with_capacity(self.graph.outputs.len());
        for spec in &self.graph.outputs {
            let value = env
                .remove(&spec.name)
                .with_context(|| format!("Graph output {:?} was never produced", spec.name))?;
            outputs.push(value);
        }
        Ok(outputs)
    }
}

fn fetch<'a>(env: &'a HashMap<String, ArrayD<f32>>, name: &str) -> Result<&'a ArrayD<f32>> {
    env.get(name)
        .with_context(|| format!("Value {name:?} is not defined at this point in the graph"))
}

fn eval_node(node: &Node, env: &HashMap<String, ArrayD<f32>>) -> Result<ArrayD<f32>> {
    let arity = |expected: usize| -> Result<()> {
        if node.inputs.len() != expected {
            bail!(
                "{:?} takes {expected} inputs, node has {}",
                node.op,
                node.inputs.len()
            );
        }
        Ok(())
    };

    match node.op {
        Op::Conv2d { stride } => {
            arity(3)?;
            let input = fetch(env, &node.inputs[0])?;
            let weight = fetch(env, &node.inputs[1])?;
            let bias = fetch(env, &node.inputs[2])?;
            conv2d_nchw(input, weight, bias, stride)
        }
        Op::Relu => {
            arity(1)?;
            Ok(fetch(env, &node.inputs[0])?.mapv(|v| v.max(0.0)))
        }
        Op::Flatten => {
            arity(1)?;
            let input = fetch(env, &node.inputs[0])?;
            let n = *input
                .shape()
                .first()
                .context("Flatten input must have a batch axis")?;
            let rest: usize = input.shape()[1..].iter().product();
            let values: Vec<f32> = input.iter().copied().collect();
            ArrayD::from_shape_vec(vec![n, rest], values).map_err(Into::into)
        }
        Op::Linear => {
            arity(3)?;
            let input = as_rank2(fetch(env, &node.inputs[0])?, "Linear input")?;
            let weight = as_rank2(fetch(env, &node.inputs[1])?, "Linear weight")?;
            let bias = as_rank1(fetch(env, &node.inputs[2])?, "Linear bias")?;
            if input.dim().1 != weight.dim().1 {
                bail!(
                    "Linear input has {} features, weight expects {}",
                    input.dim().1,
                    weight.dim().1
                );
            }
            Ok((input.dot(&weight.t()) + &bias).into_dyn())
        }
        Op::BatchNorm { eps } => {
            arity(5)?;
            let input = as_rank2(fetch(env, &node.inputs[0])?, "BatchNorm input")?;
            let scale = as_rank1(fetch(env, &node.inputs[1])?, "BatchNorm scale")?;
            let shift = as_rank1(fetch(env, &node.inputs[2])?, "BatchNorm shift")?;
            let mean = as_rank1(fetch(env, &node.inputs[3])?, "BatchNorm mean")?;
            let variance = as_rank1(fetch(env, &node.inputs[4])?, "BatchNorm variance")?;
            let features = input.dim().1;
            for (name, vector) in [
                ("scale", &scale),
                ("shift", &shift),
                ("mean", &mean),
                ("variance", &variance),
            ] {
                if vector.len() != features {
                    bail!(
                        "BatchNorm {name} has {} entries for {features} features",
                        vector.len()
                    );
                }
            }
            let mut out = input.to_owned();
            for (mut column, c) in out.axis_iter_mut(Axis(1)).zip(0..features) {
                let denom = (variance[c] + eps).sqrt();
                column.mapv_inplace(|v| (v - mean[c]) / denom * scale[c] + shift[c]);
            }
            Ok(out.into_dyn())
        }
        Op::Sub => {
            arity(2)?;
            let lhs = fetch(env, &node.inputs[0])?;
            let rhs = fetch(env, &node.inputs[1])?;
            if lhs.shape() != rhs.shape() {
                bail!(
                    "Sub operands disagree: {:?} vs {:?}",
                    lhs.shape(),
                    rhs.shape()
                );
            }
            Ok(lhs - rhs)
        }
        Op::L2Norm => {
            arity(1)?;
            let input = as_rank2(fetch(env, &node.inputs[0])?, "L2Norm input")?;
            let norms = input
                .mapv(|v| v * v)
                .sum_axis(Axis(1))
                .mapv(f32::sqrt)
                .insert_axis(Axis(1));
            Ok(norms.into_dyn())
        }
        Op::Sigmoid => {
            arity(1)?;
            Ok(fetch(env, &node.inputs[0])?.mapv(|v| 1.0 / (1.0 + (-v).exp())))
        }
    }
}

fn as_rank2<'a>(array: &'a ArrayD<f32>, what: &str) -> Result<ndarray::ArrayView2<'a, f32>> {
    array
        .view()
        .into_dimensionality()
        .with_context(|| format!("{what} must be rank 2, got shape {:?}", array.shape()))
}

fn as_rank1<'a>(array: &'a ArrayD<f32>, what: &str) -> Result<ndarray::ArrayView1<'a, f32>> {
    array
        .view()
        .into_dimensionality()
        .with_context(|| format!("{what} must be rank 1, got shape {:?}", array.shape()))
}

/// Valid-padding NCHW convolution with (out, in, kh, kw) weights
fn conv2d_nchw(
    input: &ArrayD<f32>,
    weight: &ArrayD<f32>,
    bias: &ArrayD<f32>,
    stride: usize,
) -> Result<ArrayD<f32>> {
    let input: ndarray::ArrayView4<f32> = input
        .view()
        .into_dimensionality()
        .with_context(|| format!("Conv2d input must be rank 4, got shape {:?}", input.shape()))?;
    let weight: ndarray::ArrayView4<f32> = weight
        .view()
        .into_dimensionality()
        .with_context(|| format!("Conv2d weight must be rank 4, got shape {:?}", weight.shape()))?;
    let bias = as_rank1(bias, "Conv2d bias")?;
    if stride == 0 {
        bail!("Conv2d stride must be positive");
    }

    let (n, cin, h, w) = input.dim();
    let (cout, kcin, kh, kw) = weight.dim();
    if cin != kcin {
        bail!("Conv2d input has {cin} channels, weight expects {kcin}");
    }
    if bias.len() != cout {
        bail!("Conv2d bias has {} entries for {cout} filters", bias.len());
    }
    if h < kh || w < kw {
        bail!("Conv2d input ({h}x{w}) smaller than kernel ({kh}x{kw})");
    }
    let oh = (h - kh) / stride + 1;
    let ow = (w - kw) / stride + 1;
    let mut out = Array4::<f32>::zeros((n, cout, oh, ow));
    for b in 0..n {
        for oc in 0..cout {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias[oc];
                    for ic in 0..cin {
                        for ky in 0..kh {
                            for kx in 0..kw {
                                acc += input[[b, ic, oy * stride + ky, ox * stride + kx]]
                                    * weight[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[b, oc, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}
