//! Request orchestration: generate a variant if needed, then serve the best artifact.
//!
//! ## Flow
//!
//! ```text
//! parse path ─► primary cached? ──yes──────────────────────────────┐
//!                    │ no                                           │
//!              original exists? ──no──► NotFound (404)              │
//!                    │ yes                                          │
//!              produce lock "<url>-process" ──timeout──► Busy (503) │
//!                    │                                              │
//!              primary cached now? ──yes (a racing request won)───┤
//!                    │ no                                           │
//!              read lock "<original>-read" ► decode ► release      │
//!              resize (cover / fit) if a side was requested         │
//!              encode primary + siblings (parallel, detached)       │
//!              write siblings, then primary ► release produce lock │
//!                                                                   ▼
//!                              serve: .avif sibling ► .webp sibling ► primary
//! ```
//!
//! Requests for a jpg, png or gif get the best sibling on disk. Requests
//! that already name a next-gen format (webp, avif) get exactly that format.
//!
//! Output sides are capped by `max_dimension`, both as requested and after
//! the missing side is derived; cover mode also caps the intermediate it
//! scales to before cropping. Oversized requests are refused before any
//! pixel buffer is allocated.
//!
//! The primary artifact is written last, so its existence is the commit
//! point: once a reader sees it, every sibling this attempt produced is
//! already on disk. A failed attempt removes whatever it wrote.
//!
//! Only the produce lock protects the cache path space. The read lock is a
//! short inner section around decoding the original; it is always taken
//! inside a produce lock, never the other way around, so the two cannot
//! deadlock.

use crate::config::{Config, DEFAULT_MAX_DIMENSION};
use crate::imaging::{
    BackendError, Format, ImageBackend, ImageHandle, Mode, RustBackend,
    calculate_fill_dimensions, resolve_dimensions,
};
use crate::lock::{Gate, InFlight, LockError};
use crate::request::{ParseError, SkipFormats, VariantRequest};
use crate::store::{StoreError, VariantStore};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Invalid variant path: {0}")]
    Parse(#[from] ParseError),
    #[error("Original image not found: {}", .0.display())]
    OriginalNotFound(PathBuf),
    #[error("Requested size {width}x{height} exceeds the {max}px limit")]
    TooLarge { width: u32, height: u32, max: u32 },
    #[error("Image is currently being processed")]
    Busy,
    #[error("Recursive generation of {0}")]
    Reentrant(String),
    #[error("Lock backend failed: {0}")]
    Lock(LockError),
    #[error("Image processing failed: {0}")]
    Imaging(#[from] BackendError),
    #[error("Cache error: {0}")]
    Store(#[from] StoreError),
}

impl From<LockError> for ProcessError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { .. } => Self::Busy,
            LockError::Reentrant(key) => Self::Reentrant(key),
            other => Self::Lock(other),
        }
    }
}

impl ProcessError {
    /// HTTP status this outcome maps to.
    pub fn status(&self) -> u16 {
        match self {
            Self::Parse(_) | Self::OriginalNotFound(_) | Self::TooLarge { .. } => 404,
            Self::Busy => 503,
            Self::Reentrant(_) => 508,
            Self::Lock(_) | Self::Imaging(_) | Self::Store(_) => 500,
        }
    }
}

/// The artifact chosen for a response.
#[derive(Debug, Clone)]
pub struct Served {
    pub format: Format,
    pub path: PathBuf,
    pub body: Vec<u8>,
    /// True when this request ran the transform.
    pub generated: bool,
}

impl Served {
    pub fn content_type(&self) -> &'static str {
        self.format.mime_type()
    }
}

/// One encoded output waiting to be written.
struct Artifact {
    format: Format,
    path: PathBuf,
    bytes: Vec<u8>,
}

pub struct Processor<B: ImageBackend = RustBackend> {
    backend: B,
    public_root: PathBuf,
    store: VariantStore,
    gate: Gate,
    in_flight: InFlight,
    webp: bool,
    avif: bool,
    max_dimension: u32,
}

impl Processor<RustBackend> {
    pub fn from_config(config: &Config) -> Result<Self, ProcessError> {
        let gate = config.lock.gate()?;
        Ok(Processor::new(
            RustBackend::new(),
            &config.public_root,
            VariantStore::new(&config.cache_root),
            gate,
        )
        .with_siblings(config.formats.webp, config.formats.avif)
        .with_max_dimension(config.processing.max_dimension))
    }
}

impl<B: ImageBackend> Processor<B> {
    pub fn new(backend: B, public_root: impl Into<PathBuf>, store: VariantStore, gate: Gate) -> Self {
        Self {
            backend,
            public_root: public_root.into(),
            store,
            gate,
            in_flight: InFlight::new(),
            webp: true,
            avif: true,
            max_dimension: DEFAULT_MAX_DIMENSION,
        }
    }

    /// Enable or disable sibling generation globally.
    pub fn with_siblings(mut self, webp: bool, avif: bool) -> Self {
        self.webp = webp;
        self.avif = avif;
        self
    }

    /// Refuse variants with a side longer than `max` pixels.
    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn store(&self) -> &VariantStore {
        &self.store
    }

    /// Handle a decoded request path plus its skip flags.
    pub fn handle_path(&self, path: &str, skip: SkipFormats) -> Result<Served, ProcessError> {
        let request = VariantRequest::parse(path)?.with_skip(skip);
        self.handle(&request)
    }

    /// Make sure the variant exists, then load the best artifact for it.
    pub fn handle(&self, request: &VariantRequest) -> Result<Served, ProcessError> {
        let generated = self.ensure(request)?;
        self.serve(request, generated)
    }

    /// Generate the variant unless it is already cached. Returns whether
    /// this call ran the transform.
    pub fn ensure(&self, request: &VariantRequest) -> Result<bool, ProcessError> {
        let primary = self.store.primary_path(request);
        if self.store.exists(&primary) {
            return Ok(false);
        }

        self.check_size(
            request.width.unwrap_or(0),
            request.height.unwrap_or(0),
        )?;

        let original = self.original_path(request);
        if !original.is_file() {
            return Err(ProcessError::OriginalNotFound(original));
        }

        let key = format!("{}-process", request.url_path());
        let _in_flight = self.in_flight.enter(&key)?;
        let _lock = self.gate.acquire(&key)?;

        if self.store.exists(&primary) {
            tracing::debug!(variant = %request.url_path(), "Generated by a concurrent request");
            return Ok(false);
        }

        let started = Instant::now();
        let image = self.load_original(&original)?;
        let image = self.transform(image, request)?;
        let artifacts = self.encode_all(&image, request, primary)?;
        self.persist(&artifacts)?;

        tracing::info!(
            variant = %request.url_path(),
            formats = ?artifacts.iter().map(|a| a.format).collect::<Vec<_>>(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generated variant"
        );
        Ok(true)
    }

    fn original_path(&self, request: &VariantRequest) -> PathBuf {
        self.public_root.join(request.original_path())
    }

    fn load_original(&self, original: &Path) -> Result<ImageHandle, ProcessError> {
        let key = format!("{}-read", original.display());
        let _lock = self.gate.acquire(&key)?;
        self.backend.decode(original).map_err(|e| {
            if e.is_unreadable_source() {
                tracing::warn!(original = %original.display(), error = %e, "Unreadable original");
                ProcessError::OriginalNotFound(original.to_path_buf())
            } else {
                e.into()
            }
        })
    }

    fn transform(
        &self,
        image: ImageHandle,
        request: &VariantRequest,
    ) -> Result<ImageHandle, ProcessError> {
        if request.width.is_none() && request.height.is_none() {
            return Ok(image);
        }
        let natural = image.dimensions();
        let target = resolve_dimensions(natural, request.width, request.height);
        self.check_size(target.width, target.height)?;
        if request.mode == Mode::Cover {
            let (fill_w, fill_h) = calculate_fill_dimensions(
                (natural.width, natural.height),
                (target.width, target.height),
            );
            self.check_size(fill_w, fill_h)?;
        }
        Ok(self.backend.resize(image, target, request.mode)?)
    }

    fn check_size(&self, width: u32, height: u32) -> Result<(), ProcessError> {
        if width > self.max_dimension || height > self.max_dimension {
            return Err(ProcessError::TooLarge {
                width,
                height,
                max: self.max_dimension,
            });
        }
        Ok(())
    }

    /// Formats to produce: the requested one, then every enabled sibling
    /// that is neither skipped nor the requested format itself.
    fn formats_for(&self, request: &VariantRequest) -> Vec<Format> {
        let mut formats = vec![request.format];
        formats.extend(Format::SIBLINGS.into_iter().filter(|&f| {
            let enabled = match f {
                Format::Avif => self.avif,
                Format::WebP => self.webp,
                _ => false,
            };
            enabled && f != request.format && !request.skip.contains(f)
        }));
        formats
    }

    fn encode_all(
        &self,
        image: &ImageHandle,
        request: &VariantRequest,
        primary: PathBuf,
    ) -> Result<Vec<Artifact>, ProcessError> {
        self.formats_for(request)
            .into_par_iter()
            .map(|format| -> Result<Artifact, ProcessError> {
                let bytes = self.backend.encode(image, format, request.quality)?;
                let path = if format == request.format {
                    primary.clone()
                } else {
                    self.store.sibling_path(request, format)
                };
                Ok(Artifact {
                    format,
                    path,
                    bytes,
                })
            })
            .collect()
    }

    /// Write siblings first and the primary last; undo everything on failure.
    fn persist(&self, artifacts: &[Artifact]) -> Result<(), ProcessError> {
        let mut written: Vec<&Path> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts.iter().rev() {
            if let Err(e) = self.store.write(&artifact.path, &artifact.bytes) {
                for path in written {
                    if let Err(cleanup) = self.store.remove(path) {
                        tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove partial artifact");
                    }
                }
                return Err(e.into());
            }
            written.push(artifact.path.as_path());
        }
        Ok(())
    }

    /// Content negotiation: AVIF sibling, then WebP sibling, then the
    /// primary. A request that names a next-gen format is served as asked.
    fn serve(&self, request: &VariantRequest, generated: bool) -> Result<Served, ProcessError> {
        let substitutes: &[Format] = if Format::SIBLINGS.contains(&request.format) {
            &[]
        } else {
            &Format::SIBLINGS
        };
        let candidates = substitutes
            .iter()
            .map(|&f| (f, self.store.sibling_path(request, f)))
            .chain(std::iter::once((
                request.format,
                self.store.primary_path(request),
            )));

        for (format, path) in candidates {
            if self.store.exists(&path) {
                let body = self.store.read(&path)?;
                return Ok(Served {
                    format,
                    path,
                    body,
                    generated,
                });
            }
        }

        // The primary vanished between ensure and serve (e.g. a purge).
        Err(ProcessError::Store(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("variant disappeared: {}", request.url_path()),
        ))))
    }
}
