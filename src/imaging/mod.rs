//! Image processing: pure Rust decoders, resamplers and encoders.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** | `image::image_dimensions`, `avif-parse` for AVIF |
//! | **Decode** | `image` crate, `rav1d` for AVIF |
//! | **Cover / fit** | Lanczos3 resize + center crop |
//! | **Encode** | JPEG, PNG, GIF, WebP (`webp`), AVIF (rav1e) |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Value types describing an output (quality, mode, format)
//! - **Backend**: [`ImageBackend`] trait + [`ImageHandle`] + [`RustBackend`]

pub mod backend;
mod calculations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, ImageBackend, ImageHandle};
pub use calculations::{
    calculate_fill_dimensions, calculate_fit_dimensions, center_crop_offset, resolve_dimensions,
};
pub use params::{Dimensions, Format, Mode, Quality, ResolvedDimensions};
pub use rust_backend::RustBackend;
