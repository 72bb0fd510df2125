//! Parameter types for image operations.
//!
//! These types describe *what* to produce, not *how*. They are shared by the
//! request codec (which parses them out of a URL), the geometry calculations,
//! and the [`backend`](super::backend) (which does the pixel work).
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 100). Clamped on construction.
//! - [`Mode`]: Cover (crop to fill) or fit (scale to contain).
//! - [`Format`]: Output raster formats, their extensions and MIME types.
//! - [`Dimensions`]: Natural size of a decoded or identified image.
//! - [`ResolvedDimensions`]: Target box after the missing side has been derived.

use std::fmt;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quality(u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(100)
    }
}

/// How a source is fitted into the requested box.
///
/// Encoded in request paths as `m0` (cover) and `m1` (fit). Any other
/// number falls back to cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Scale to fill the box, then center-crop the overflow.
    #[default]
    Cover,
    /// Scale to fit inside the box without cropping.
    Fit,
}

impl Mode {
    pub fn from_number(n: u32) -> Self {
        match n {
            1 => Self::Fit,
            _ => Self::Cover,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Self::Cover => 0,
            Self::Fit => 1,
        }
    }
}

/// Output raster formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Jpeg,
    Png,
    Gif,
    WebP,
    Avif,
}

impl Format {
    /// Next-gen formats generated next to the primary artifact, in the order
    /// they are preferred when serving (first match wins).
    pub const SIBLINGS: [Format; 2] = [Format::Avif, Format::WebP];

    /// Parse a file extension, case-insensitively. `jpeg` collapses to [`Format::Jpeg`].
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }

    /// Canonical extension token.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Avif => "avif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Avif => "image/avif",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Natural size of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Target box with both sides known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDimensions {
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_clamps_to_valid_range() {
        assert_eq!(Quality::new(0).value(), 1);
        assert_eq!(Quality::new(50).value(), 50);
        assert_eq!(Quality::new(150).value(), 100);
    }

    #[test]
    fn quality_default_is_100() {
        assert_eq!(Quality::default().value(), 100);
    }

    #[test]
    fn unknown_mode_number_falls_back_to_cover() {
        assert_eq!(Mode::from_number(0), Mode::Cover);
        assert_eq!(Mode::from_number(1), Mode::Fit);
        assert_eq!(Mode::from_number(99), Mode::Cover);
    }

    #[test]
    fn jpeg_alias_collapses_to_jpg() {
        assert_eq!(Format::from_extension("jpeg"), Some(Format::Jpeg));
        assert_eq!(Format::from_extension("JPG"), Some(Format::Jpeg));
        assert_eq!(Format::Jpeg.extension(), "jpg");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert_eq!(Format::from_extension("tiff"), None);
        assert_eq!(Format::from_extension(""), None);
    }

    #[test]
    fn mime_types() {
        assert_eq!(Format::WebP.mime_type(), "image/webp");
        assert_eq!(Format::Avif.mime_type(), "image/avif");
        assert_eq!(Format::Jpeg.mime_type(), "image/jpeg");
    }

    #[test]
    fn avif_is_preferred_over_webp() {
        assert_eq!(Format::SIBLINGS, [Format::Avif, Format::WebP]);
    }
}
