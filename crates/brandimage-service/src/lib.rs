//! Product image resolution for the ordering portal.
//!
//! Resolves a product's brand and SKU to a displayable image URL on the image origin,
//! probing the origin at most once per image and sharing the outcome with every
//! surface that asks for it. See [`cache::ImageCache`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod brand;
pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod logging;
pub mod probe;
pub mod utils;
pub mod variant;


pub use cache::{CacheStats, ImageCache, ResolutionState};
pub use error::{ImageUnavailable, ProbeError, Resolution, ResolutionReport, ResolvedImage};
pub use variant::SizeVariant;
