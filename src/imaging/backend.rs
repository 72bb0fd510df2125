//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the four operations the variant
//! pipeline needs: identify, decode, resize, and encode.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend): pure Rust decoders and
//! encoders from the `image` ecosystem.
//!
//! ## Snapshot discipline
//!
//! A request encodes one decoded image into several formats. Encoders often
//! need a converted copy (JPEG drops alpha, WebP wants RGB(A)8), so
//! [`ImageHandle`] never hands out its pixels mutably: every encode goes
//! through [`ImageHandle::detached`], which gives the operation its own
//! clone and drops it afterwards. Encoding order therefore never changes
//! output bytes.

use super::params::{Dimensions, Format, Mode, Quality, ResolvedDimensions};
use image::DynamicImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to decode {path}: {reason}")]
    Decode { path: String, reason: String },
    #[error("Failed to encode {format}: {reason}")]
    Encode { format: Format, reason: String },
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

impl BackendError {
    /// True when the source is missing or not a readable image.
    pub fn is_unreadable_source(&self) -> bool {
        match self {
            Self::Decode { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// A decoded image owned by one request.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    image: DynamicImage,
}

impl ImageHandle {
    pub fn new(image: DynamicImage) -> Self {
        Self { image }
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }

    /// Run `op` on a private copy of the pixels.
    ///
    /// The copy is dropped when `op` returns, so whatever `op` converts or
    /// consumes never reaches later operations on this handle.
    pub fn detached<T>(&self, op: impl FnOnce(DynamicImage) -> T) -> T {
        op(self.image.clone())
    }
}

/// Trait for image processing backends.
///
/// Every backend must implement all four operations so the orchestrator is
/// backend-agnostic (and testable with a mock).
pub trait ImageBackend: Sync {
    /// Get image dimensions without a full decode where possible.
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError>;

    /// Decode an original from disk.
    fn decode(&self, path: &Path) -> Result<ImageHandle, BackendError>;

    /// Cover or fit the image into `target`.
    fn resize(
        &self,
        image: ImageHandle,
        target: ResolvedDimensions,
        mode: Mode,
    ) -> Result<ImageHandle, BackendError>;

    /// Encode to `format`. Must not alter `image`.
    fn encode(
        &self,
        image: &ImageHandle,
        format: Format,
        quality: Quality,
    ) -> Result<Vec<u8>, BackendError>;
}
