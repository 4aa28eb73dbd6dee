//! Portable interchange graph: export from Candle, verify on an independent runtime
//!
//! The exported artifact is a serialized computation graph with named inputs
//! and outputs and a dynamic batch axis. Verification never touches Candle:
//! the runtime executes the graph with its own ndarray kernels, so agreement
//! between the two proves the export preserved numerical behavior.

pub mod export;
pub mod graph;
pub mod runtime;

pub use export::export_matcher;
pub use graph::{Dim, InterchangeGraph, Node, Op, TensorData, TensorSpec};
pub use runtime::InterchangeSession;
