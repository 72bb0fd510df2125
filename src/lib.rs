//! # variant-forge
//!
//! An on-the-fly image variant server. Templates link to URLs that encode an
//! original image plus the wanted size, crop mode, quality and format; the
//! first request for such a URL generates the variant (and AVIF/WebP
//! siblings) into a cache directory, every later request is served from disk.
//!
//! ```text
//! GET /processed/images/photo.w800h400m1q75.jpg
//!        │
//!        ▼
//! request    parse path + ?skipWebP / ?skipAvif
//!        │
//!        ▼
//! processor  cached? ─► lock ─► decode ─► resize ─► encode ─► store
//!        │
//!        ▼
//! serve      .avif sibling ► .webp sibling ► primary
//! ```
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`request`] | Variant path codec, skip flags, URL and `srcset` builders |
//! | [`imaging`] | Geometry math, `ImageBackend` trait, pure-Rust decode/resize/encode |
//! | [`lock`] | Named locks (memory, lock files), bounded-retry `Gate`, re-entrancy guard |
//! | [`store`] | Cache paths, atomic writes, stats and purge |
//! | [`processor`] | Generate-or-serve orchestration and error-to-status mapping |
//! | [`server`] | axum router for `GET /processed/...` |
//! | [`config`] | `variant-forge.toml` loading, validation, stock defaults |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## The URL Is the Cache Key
//!
//! A variant's cache path is its request path under the cache root. Every
//! parameter that affects output bytes is in the path, so the cache needs no
//! index, no invalidation and no versioning: a new parameter tuple is a new
//! file, and `purge` is the only way anything goes away. Two URLs that differ
//! only in token field order are two cache entries; the URL builder always
//! emits one canonical order so templates never produce both.
//!
//! ## One Generation per Variant
//!
//! Many browsers asking for a freshly-referenced image at once must not run
//! the transform many times. Generation of one variant is serialized by a
//! named lock over its request path; late arrivals wait a bounded time and
//! then find the finished file. A client that waits too long gets a 503 and
//! retries, which browsers do on their own.
//!
//! ## Self-Contained Imaging
//!
//! Decoding, Lanczos3 resampling and encoding use the `image` crate, AVIF
//! decoding goes through `avif-parse` + `rav1d`, AVIF encoding through
//! `rav1e` (via `image`). Lossy WebP comes from `webp`, which bundles
//! libwebp. No ImageMagick, no system libraries to install.

pub mod config;
pub mod imaging;
pub mod lock;
pub mod output;
pub mod processor;
pub mod request;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
