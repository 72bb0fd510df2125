//! Variant request paths: parsing, canonical encoding, and URL building.
//!
//! A variant is addressed by a path that carries every generation parameter:
//!
//! ```text
//! /processed/images/photo.w800h400m1q75.webp?skipAvif=1
//!            └────┬─────┘ └────┬────┘ └┬─┘ └────┬───┘
//!            original stem   mode token ext   query flags
//! ```
//!
//! The mode token is any concatenation of `w<digits>`, `h<digits>`,
//! `q<digits>` and `m<digits>` in any order. Absent `w`/`h` mean "derive from
//! the source aspect ratio", absent `q` means 100, absent `m` means cover.
//! The original lives at `<stem>.<ext>`; `jpeg` and `jpg` select the same
//! encoder but the literal extension is kept for path derivation, so the
//! cache file for a URL is always the URL itself under the cache root.
//!
//! [`VariantRequest::parse`] and [`VariantRequest::to_url`] are inverse for
//! canonical requests (those built with [`VariantRequest::new`]).

use crate::imaging::{Format, Mode, Quality};
use thiserror::Error;

/// URL prefix routed to the processor.
pub const PROCESSED_PREFIX: &str = "/processed/";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Not a processed path: {0}")]
    NotProcessed(String),
    #[error("Malformed variant path: {0}")]
    Malformed(String),
    #[error("Unsupported image extension: {0}")]
    UnsupportedExtension(String),
    #[error("Value for '{field}' out of range: {value}")]
    InvalidNumber { field: char, value: String },
    #[error("Unsafe path segment in: {0}")]
    UnsafePath(String),
}

/// Sibling formats the client asked us not to generate.
///
/// Set per request through `?skipWebP=1` / `?skipAvif=1`. Skipping never
/// deletes a sibling that already exists on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFormats {
    pub webp: bool,
    pub avif: bool,
}

impl SkipFormats {
    pub fn contains(self, format: Format) -> bool {
        match format {
            Format::WebP => self.webp,
            Format::Avif => self.avif,
            _ => false,
        }
    }

    /// Read `skipWebP` / `skipAvif` from a raw query string.
    ///
    /// A flag is set when present with a value other than empty, `0` or `false`.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut skip = Self::default();
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(value).map(|v| v.into_owned()).unwrap_or_default();
            match key {
                "skipWebP" => skip.webp = is_truthy(&value),
                "skipAvif" => skip.avif = is_truthy(&value),
                _ => {}
            }
        }
        skip
    }

    fn to_query(self) -> Option<String> {
        let mut parts = Vec::new();
        if self.webp {
            parts.push("skipWebP=1");
        }
        if self.avif {
            parts.push("skipAvif=1");
        }
        (!parts.is_empty()).then(|| parts.join("&"))
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "0" | "false")
}

/// A parsed variant request. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRequest {
    /// Original path without extension, relative to the public root.
    pub stem: String,
    /// Mode token exactly as it appeared in the path.
    pub token: String,
    /// Extension exactly as it appeared in the path.
    pub extension: String,
    /// Encoder selected by the extension (`jpeg` → JPEG).
    pub format: Format,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Quality,
    pub mode: Mode,
    pub skip: SkipFormats,
}

impl VariantRequest {
    /// Build a canonical request for an original such as `images/photo.jpg`.
    ///
    /// A width or height of 0 means "not given".
    pub fn new(
        original: &str,
        width: u32,
        height: u32,
        mode: Mode,
        quality: Quality,
    ) -> Result<Self, ParseError> {
        let original = original.trim_start_matches('/');
        let (stem, extension) = original
            .rsplit_once('.')
            .filter(|(stem, _)| !stem.is_empty())
            .ok_or_else(|| ParseError::Malformed(original.to_string()))?;
        check_stem(stem)?;
        let format = parse_extension(extension)?;
        let width = (width > 0).then_some(width);
        let height = (height > 0).then_some(height);

        Ok(Self {
            stem: stem.to_string(),
            token: encode_token(width, height, mode, quality),
            extension: extension.to_string(),
            format,
            width,
            height,
            quality,
            mode,
            skip: SkipFormats::default(),
        })
    }

    /// Parse a percent-decoded request path (`/processed/...`) with the
    /// query already removed. A `?` here is part of the file name.
    pub fn parse(path: &str) -> Result<Self, ParseError> {
        let rest = path
            .strip_prefix(PROCESSED_PREFIX)
            .ok_or_else(|| ParseError::NotProcessed(path.to_string()))?;

        let malformed = || ParseError::Malformed(path.to_string());
        let mut parts = rest.rsplitn(3, '.');
        let extension = parts.next().ok_or_else(malformed)?;
        let token = parts.next().ok_or_else(malformed)?;
        let stem = parts.next().ok_or_else(malformed)?;

        let extension_ok = (1..=4).contains(&extension.len())
            && extension.bytes().all(|b| b.is_ascii_alphanumeric());
        let token_ok = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_digit() || matches!(b, b'w' | b'h' | b'q' | b'm'));
        if !extension_ok || !token_ok || stem.is_empty() {
            return Err(malformed());
        }
        check_stem(stem)?;
        let format = parse_extension(extension)?;
        let fields = TokenFields::parse(token)?;

        Ok(Self {
            stem: stem.to_string(),
            token: token.to_string(),
            extension: extension.to_string(),
            format,
            width: fields.w.filter(|&w| w > 0),
            height: fields.h.filter(|&h| h > 0),
            quality: fields.q.map_or_else(Quality::default, Quality::new),
            mode: fields.m.map_or_else(Mode::default, Mode::from_number),
            skip: SkipFormats::default(),
        })
    }

    /// Parse a raw URL: percent-decode the path, read the skip flags from the query.
    pub fn parse_url(url: &str) -> Result<Self, ParseError> {
        let (path, query) = match url.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (url, None),
        };
        let decoded =
            urlencoding::decode(path).map_err(|_| ParseError::Malformed(path.to_string()))?;
        Ok(Self::parse(&decoded)?.with_skip(SkipFormats::from_query(query)))
    }

    pub fn with_skip(mut self, skip: SkipFormats) -> Self {
        self.skip = skip;
        self
    }

    /// Original image path relative to the public root.
    pub fn original_path(&self) -> String {
        format!("{}.{}", self.stem, self.extension)
    }

    /// Primary artifact path relative to the cache root.
    pub fn variant_path(&self) -> String {
        format!("{}.{}.{}", self.stem, self.token, self.extension)
    }

    /// Request path (without query) that addresses this variant.
    pub fn url_path(&self) -> String {
        format!("{}{}", PROCESSED_PREFIX, self.variant_path())
    }

    /// Request URL including skip flags.
    pub fn to_url(&self) -> String {
        match self.skip.to_query() {
            Some(query) => format!("{}?{}", self.url_path(), query),
            None => self.url_path(),
        }
    }
}

fn parse_extension(extension: &str) -> Result<Format, ParseError> {
    Format::from_extension(extension)
        .ok_or_else(|| ParseError::UnsupportedExtension(extension.to_string()))
}

/// Reject stems that could escape the public root.
fn check_stem(stem: &str) -> Result<(), ParseError> {
    let unsafe_segment = stem
        .split(['/', '\\'])
        .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if unsafe_segment || stem.contains('\0') {
        return Err(ParseError::UnsafePath(stem.to_string()));
    }
    Ok(())
}

/// Fields of a mode token. The first occurrence of each key wins.
#[derive(Debug, Default, PartialEq, Eq)]
struct TokenFields {
    w: Option<u32>,
    h: Option<u32>,
    q: Option<u32>,
    m: Option<u32>,
}

impl TokenFields {
    fn parse(token: &str) -> Result<Self, ParseError> {
        let mut fields = Self::default();
        let bytes = token.as_bytes();
        let mut i = 0;

        while i < bytes.len() {
            let key = bytes[i];
            let digits_end = bytes[i + 1..]
                .iter()
                .position(|b| !b.is_ascii_digit())
                .map_or(bytes.len(), |n| i + 1 + n);

            if !key.is_ascii_digit() && digits_end > i + 1 {
                let digits = &token[i + 1..digits_end];
                let value = digits.parse::<u32>().map_err(|_| ParseError::InvalidNumber {
                    field: key as char,
                    value: digits.to_string(),
                })?;
                let slot = match key {
                    b'w' => &mut fields.w,
                    b'h' => &mut fields.h,
                    b'q' => &mut fields.q,
                    _ => &mut fields.m,
                };
                slot.get_or_insert(value);
                i = digits_end;
            } else {
                i += 1;
            }
        }

        Ok(fields)
    }
}

/// Canonical mode token: `w`, `h`, `m`, `q` in that order, absent sides omitted.
pub fn encode_token(width: Option<u32>, height: Option<u32>, mode: Mode, quality: Quality) -> String {
    let mut token = String::new();
    if let Some(w) = width {
        token.push_str(&format!("w{w}"));
    }
    if let Some(h) = height {
        token.push_str(&format!("h{h}"));
    }
    token.push_str(&format!("m{}q{}", mode.number(), quality.value()));
    token
}

/// Build the processed URL for a public image path such as `/images/photo.jpg`.
///
/// Paths that cannot be processed (SVG, no or unknown extension, unsafe
/// segments) are returned unchanged so templates can link them directly.
pub fn variant_url(
    original: &str,
    width: u32,
    height: u32,
    mode: Mode,
    quality: Quality,
    skip: SkipFormats,
) -> String {
    match VariantRequest::new(original, width, height, mode, quality) {
        Ok(request) => request.with_skip(skip).to_url(),
        Err(_) => original.to_string(),
    }
}

/// `srcset` value offering the variant at 1x and 2x density.
pub fn srcset(original: &str, width: u32, height: u32, mode: Mode, quality: Quality) -> String {
    let skip = SkipFormats::default();
    format!(
        "{}, {} 2x",
        variant_url(original, width, height, mode, quality, skip),
        variant_url(
            original,
            width.saturating_mul(2),
            height.saturating_mul(2),
            mode,
            quality,
            skip
        )
    )
}
