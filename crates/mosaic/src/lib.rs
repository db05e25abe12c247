//! Umbrella crate for Mosaic.
//!
//! Re-exports the engine and protocol crates so downstream code can depend on
//! a single crate name (`mosaic`).

pub use mosaic_engine as engine;
pub use mosaic_protocol as protocol;
