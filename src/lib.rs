//! # fingermatch - Cross-Backend Fingerprint Verification
//!
//! Converts and validates VerifyNet weights between two tensor backends: a
//! channel-last reference implementation and a channel-first Candle
//! implementation.
//!
//! ## Features
//!
//! - Layer-by-layer weight conversion with exact layout transposition
//! - Atomic parameter commit: a failed conversion never leaves a half-written model
//! - Parity harness proving both backends agree numerically
//! - Portable interchange graph export verified on an independent runtime
//! - Pluggable backend registry with case-insensitive lookup
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fingermatch::backend::reference::ReferenceVerifyNet;
//! use fingermatch::backend::candle::CandleVerifyNet;
//! use fingermatch::convert::convert;
//!
//! let source = ReferenceVerifyNet::from_safetensors("verify_net.safetensors", shape)?;
//! let destination = CandleVerifyNet::new_random(shape, &device)?;
//! convert(&source, &destination)?;
//! destination.save("verify_net_candle.safetensors")?;
//! ```

// Require docs for public items, but not struct fields (too verbose)
#![warn(missing_docs)]
#![allow(rustdoc::missing_crate_level_docs)]

pub mod backend;
pub mod convert;
pub mod interchange;
pub mod parity;
pub mod registry;

// Re-exports for convenience
pub use backend::{parse_precision, InputShape};
pub use parity::{HarnessConfig, ParityHarness};
pub use registry::{available_backends, get_backend, register_backend, unregister_backend};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of minutiae feature columns in a matcher input
pub const DEFAULT_FEATURES: usize = 9;

/// Environment variable consulted when no backend name is given
pub const BACKEND_ENV_VAR: &str = "FINGERMATCH_BACKEND";
