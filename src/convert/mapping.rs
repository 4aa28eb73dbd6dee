//! Static layer-name mapping between the two VerifyNet graphs
//!
//! One descriptor per learnable layer, in architecture construction order.
//! The mapping drives the converter; completeness against the destination
//! model is enforced at commit time, so a layer missing here fails the
//! conversion instead of silently leaving random weights in place.

use crate::backend::candle::param_prefixes;
use crate::backend::reference::layer_names;

/// How a layer's raw weights must be transformed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    /// Kernel (kh, kw, in, out) -> (out, in, kh, kw), bias copied
    Convolutional,
    /// Kernel (in, out) -> (out, in), bias copied
    Dense,
    /// Scale, shift, running mean, running variance copied as rank-1 vectors
    Normalization,
}

/// Associates one source layer with one destination parameter prefix
#[derive(Debug, Clone, Copy)]
pub struct LayerDescriptor {
    /// Fully-qualified layer name in the source model
    pub source_name: &'static str,
    /// Destination parameter-name prefix this layer populates
    pub destination_prefix: &'static str,
    /// Transform dispatch kind
    pub kind: LayerKind,
}

/// The VerifyNet mapping, ordered to match the architecture
pub const VERIFY_NET_MAPPING: &[LayerDescriptor] = &[
    LayerDescriptor {
        source_name: layer_names::CONV1,
        destination_prefix: param_prefixes::CONV1,
        kind: LayerKind::Convolutional,
    },
    LayerDescriptor {
        source_name: layer_names::CONV2,
        destination_prefix: param_prefixes::CONV2,
        kind: LayerKind::Convolutional,
    },
    LayerDescriptor {
        source_name: layer_names::DENSE,
        destination_prefix: param_prefixes::DENSE,
        kind: LayerKind::Dense,
    },
    LayerDescriptor {
        source_name: layer_names::BATCH_NORM,
        destination_prefix: param_prefixes::BN,
        kind: LayerKind::Normalization,
    },
    LayerDescriptor {
        source_name: layer_names::OUTPUT,
        destination_prefix: param_prefixes::FC,
        kind: LayerKind::Dense,
    },
];

/// The static VerifyNet mapping
pub fn verify_net_mapping() -> &'static [LayerDescriptor] {
    VERIFY_NET_MAPPING
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_mapping_has_unique_names() {
        let sources: HashSet<_> = VERIFY_NET_MAPPING.iter().map(|d| d.source_name).collect();
        let prefixes: HashSet<_> = VERIFY_NET_MAPPING
            .iter()
            .map(|d| d.destination_prefix)
            .collect();
        assert_eq!(sources.len(), VERIFY_NET_MAPPING.len());
        assert_eq!(prefixes.len(), VERIFY_NET_MAPPING.len());
    }

    #[test]
    fn test_mapping_order_follows_architecture() {
        let prefixes: Vec<_> = VERIFY_NET_MAPPING
            .iter()
            .map(|d| d.destination_prefix)
            .collect();
        assert_eq!(
            prefixes,
            vec![
                "embedding.conv1",
                "embedding.conv2",
                "embedding.dense",
                "bn",
                "fc"
            ]
        );
    }
}
