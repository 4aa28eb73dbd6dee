//! Weight conversion between the reference and Candle backends
//!
//! Three layers: pure axis-layout transforms, the static layer-name mapping,
//! and the converter that drives both and commits the result atomically.

pub mod converter;
pub mod layout;
pub mod mapping;

pub use converter::{convert, convert_with_mapping, WeightSource};
pub use mapping::{verify_net_mapping, LayerDescriptor, LayerKind};
