//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, GIF, WebP) | `image` crate (pure Rust decoders) |
//! | Decode (AVIF) | `avif-parse` (container) + `rav1d` (AV1 decode) + custom YUV→RGB, alpha item merged |
//! | Cover | fill-resize with `Lanczos3`, then center crop |
//! | Fit | aspect-preserving resize with `Lanczos3` |
//! | Encode → JPEG / PNG / GIF | `image::codecs` encoders |
//! | Encode → WebP | `webp` (lossy, quality-controlled) |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//!
//! Animated GIF and WebP originals are decoded as their first frame, so
//! every variant of them is a still image.

use super::backend::{BackendError, ImageBackend, ImageHandle};
use super::calculations::{calculate_fill_dimensions, calculate_fit_dimensions, center_crop_offset};
use super::params::{Dimensions, Format, Mode, Quality, ResolvedDimensions};
use image::codecs::avif::AvifEncoder;
use image::codecs::gif::GifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Frame, ImageReader};
use std::path::Path;

/// AVIF encoder speed (0 = slowest/best, 10 = fastest).
const AVIF_SPEED: u8 = 6;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
#[derive(Debug, Default)]
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

fn is_avif(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("avif"))
}

fn decode_error(path: &Path, reason: impl ToString) -> BackendError {
    BackendError::Decode {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Load and decode an image from disk.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    if is_avif(path) {
        return decode_avif(path);
    }
    ImageReader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| decode_error(path, e))
}

/// Extract dimensions from an AVIF file's container metadata (no full decode needed).
fn identify_avif(path: &Path) -> Result<Dimensions, BackendError> {
    let file_data = std::fs::read(path)?;
    let avif = avif_parse::read_avif(&mut std::io::Cursor::new(&file_data))
        .map_err(|e| decode_error(path, format!("{e:?}")))?;
    let meta = avif
        .primary_item_metadata()
        .map_err(|e| decode_error(path, format!("{e:?}")))?;
    Ok(Dimensions {
        width: meta.max_frame_width.get(),
        height: meta.max_frame_height.get(),
    })
}

/// Decode an AVIF file using avif-parse (container) + rav1d (AV1 decode).
///
/// The `image` crate's `"avif"` feature only provides the encoder (rav1e).
/// Decoding requires `"avif-native"` which depends on the C library dav1d,
/// so the pure Rust port is driven directly instead. An alpha item is
/// decoded as a second AV1 image and becomes the alpha channel.
fn decode_avif(path: &Path) -> Result<DynamicImage, BackendError> {
    let file_data = std::fs::read(path)?;
    let avif = avif_parse::read_avif(&mut std::io::Cursor::new(&file_data))
        .map_err(|e| decode_error(path, format!("{e:?}")))?;

    let (w, h, rgb) = decode_av1(path, &avif.primary_item, picture_to_rgb)?;
    let Some(alpha_item) = avif.alpha_item.as_deref() else {
        return image::RgbImage::from_raw(w, h, rgb)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| decode_error(path, "decoded AVIF buffer has the wrong size"));
    };

    let (aw, ah, alpha) = decode_av1(path, alpha_item, picture_to_luma)?;
    if (aw, ah) != (w, h) {
        return Err(decode_error(
            path,
            format!("AVIF alpha is {aw}x{ah}, color is {w}x{h}"),
        ));
    }
    let rgba = merge_alpha(&rgb, &alpha, avif.premultiplied_alpha);
    image::RgbaImage::from_raw(w, h, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| decode_error(path, "decoded AVIF buffer has the wrong size"))
}

/// Decode one AV1 still image and hand the picture to `convert`.
fn decode_av1<T>(
    path: &Path,
    av1_bytes: &[u8],
    convert: impl FnOnce(&rav1d::include::dav1d::picture::Dav1dPicture) -> Result<T, String>,
) -> Result<T, BackendError> {
    use rav1d::include::dav1d::data::Dav1dData;
    use rav1d::include::dav1d::dav1d::Dav1dSettings;
    use rav1d::include::dav1d::picture::Dav1dPicture;
    use rav1d::src::lib as dav1d;
    use std::ptr::NonNull;

    let mut settings = std::mem::MaybeUninit::<Dav1dSettings>::uninit();
    let settings_ptr = NonNull::new(settings.as_mut_ptr())
        .ok_or_else(|| decode_error(path, "settings allocation failed"))?;
    unsafe { dav1d::dav1d_default_settings(settings_ptr) };
    let mut settings = unsafe { settings.assume_init() };
    settings.n_threads = 1;
    settings.max_frame_delay = 1;

    let mut ctx = None;
    let rc = unsafe { dav1d::dav1d_open(NonNull::new(&mut ctx), NonNull::new(&mut settings)) };
    if rc.0 != 0 {
        return Err(decode_error(path, format!("rav1d open failed ({})", rc.0)));
    }

    // Everything between open and close; the context is closed exactly once below.
    let decode = || -> Result<T, BackendError> {
        let mut data = Dav1dData::default();
        let buf_ptr = unsafe { dav1d::dav1d_data_create(NonNull::new(&mut data), av1_bytes.len()) };
        if buf_ptr.is_null() {
            return Err(decode_error(path, "rav1d data_create failed"));
        }
        unsafe { std::ptr::copy_nonoverlapping(av1_bytes.as_ptr(), buf_ptr, av1_bytes.len()) };

        let rc = unsafe { dav1d::dav1d_send_data(ctx, NonNull::new(&mut data)) };
        if rc.0 != 0 {
            unsafe { dav1d::dav1d_data_unref(NonNull::new(&mut data)) };
            return Err(decode_error(path, format!("rav1d send_data failed ({})", rc.0)));
        }

        let mut pic: Dav1dPicture = unsafe { std::mem::zeroed() };
        let rc = unsafe { dav1d::dav1d_get_picture(ctx, NonNull::new(&mut pic)) };
        if rc.0 != 0 {
            return Err(decode_error(path, format!("rav1d get_picture failed ({})", rc.0)));
        }

        let converted = convert(&pic).map_err(|reason| decode_error(path, reason));
        unsafe { dav1d::dav1d_picture_unref(NonNull::new(&mut pic)) };
        converted
    };
    let decoded = decode();
    unsafe { dav1d::dav1d_close(NonNull::new(&mut ctx)) };
    decoded
}

/// The luma plane of a decoded alpha item, scaled to 8 bits.
fn picture_to_luma(
    pic: &rav1d::include::dav1d::picture::Dav1dPicture,
) -> Result<(u32, u32, Vec<u8>), String> {
    let width = pic.p.w as u32;
    let height = pic.p.h as u32;
    let bpc = pic.p.bpc as u32;
    let y_ptr = pic.data[0]
        .map(|p| p.as_ptr() as *const u8)
        .ok_or("AVIF alpha plane missing")?;
    let scale = 255.0 / ((1u32 << bpc) - 1) as f32;

    let mut luma = Vec::with_capacity((width * height) as usize);
    for row in 0..height {
        for col in 0..width {
            let v = read_sample(y_ptr, pic.stride[0], col, row, bpc) * scale;
            luma.push(v.round().clamp(0.0, 255.0) as u8);
        }
    }
    Ok((width, height, luma))
}

/// Interleave RGB and alpha into RGBA, undoing premultiplication if set.
fn merge_alpha(rgb: &[u8], alpha: &[u8], premultiplied: bool) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(alpha.len() * 4);
    for (px, &a) in rgb.chunks_exact(3).zip(alpha) {
        for &c in px {
            let c = if premultiplied && a > 0 {
                ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8
            } else {
                c
            };
            rgba.push(c);
        }
        rgba.push(a);
    }
    rgba
}

/// Convert a decoded rav1d picture to interleaved RGB8.
fn picture_to_rgb(
    pic: &rav1d::include::dav1d::picture::Dav1dPicture,
) -> Result<(u32, u32, Vec<u8>), String> {
    use rav1d::include::dav1d::headers::{
        DAV1D_PIXEL_LAYOUT_I400, DAV1D_PIXEL_LAYOUT_I420, DAV1D_PIXEL_LAYOUT_I422,
        DAV1D_PIXEL_LAYOUT_I444,
    };

    let width = pic.p.w as u32;
    let height = pic.p.h as u32;
    let layout = pic.p.layout;
    let plane = |i: usize| {
        pic.data[i]
            .map(|p| p.as_ptr() as *const u8)
            .ok_or_else(|| format!("AVIF plane {i} missing"))
    };
    let y_ptr = plane(0)?;

    let (u_ptr, v_ptr, ss_x, ss_y, monochrome) = match layout {
        DAV1D_PIXEL_LAYOUT_I400 => (y_ptr, y_ptr, false, false, true),
        DAV1D_PIXEL_LAYOUT_I420 => (plane(1)?, plane(2)?, true, true, false),
        DAV1D_PIXEL_LAYOUT_I422 => (plane(1)?, plane(2)?, true, false, false),
        DAV1D_PIXEL_LAYOUT_I444 => (plane(1)?, plane(2)?, false, false, false),
        _ => return Err(format!("Unsupported AVIF pixel layout: {layout}")),
    };

    let planes = YuvPlanes {
        y_ptr,
        u_ptr,
        v_ptr,
        y_stride: pic.stride[0],
        uv_stride: if monochrome { 0 } else { pic.stride[1] },
        width,
        height,
        bpc: pic.p.bpc as u32,
        ss_x,
        ss_y,
        monochrome,
    };
    Ok((width, height, planes.to_rgb()))
}

/// Decoded YUV plane data from rav1d, ready for RGB conversion.
struct YuvPlanes {
    y_ptr: *const u8,
    u_ptr: *const u8,
    v_ptr: *const u8,
    y_stride: isize,
    uv_stride: isize,
    width: u32,
    height: u32,
    bpc: u32,
    /// Chroma subsampling: horizontal, vertical (e.g. I420 = true, true)
    ss_x: bool,
    ss_y: bool,
    monochrome: bool,
}

impl YuvPlanes {
    /// Convert YUV planes to interleaved RGB8 using BT.601 coefficients.
    fn to_rgb(&self) -> Vec<u8> {
        let max_val = ((1u32 << self.bpc) - 1) as f32;
        let center = (1u32 << (self.bpc - 1)) as f32;
        let scale = 255.0 / max_val;

        let mut rgb = vec![0u8; (self.width * self.height * 3) as usize];

        for row in 0..self.height {
            for col in 0..self.width {
                let y_val = read_sample(self.y_ptr, self.y_stride, col, row, self.bpc);

                let (r, g, b) = if self.monochrome {
                    let v = (y_val * scale).clamp(0.0, 255.0);
                    (v, v, v)
                } else {
                    let c_col = if self.ss_x { col / 2 } else { col };
                    let c_row = if self.ss_y { row / 2 } else { row };
                    let cb = read_sample(self.u_ptr, self.uv_stride, c_col, c_row, self.bpc) - center;
                    let cr = read_sample(self.v_ptr, self.uv_stride, c_col, c_row, self.bpc) - center;

                    (
                        ((y_val + 1.402 * cr) * scale).clamp(0.0, 255.0),
                        ((y_val - 0.344136 * cb - 0.714136 * cr) * scale).clamp(0.0, 255.0),
                        ((y_val + 1.772 * cb) * scale).clamp(0.0, 255.0),
                    )
                };

                let idx = ((row * self.width + col) * 3) as usize;
                rgb[idx] = r as u8;
                rgb[idx + 1] = g as u8;
                rgb[idx + 2] = b as u8;
            }
        }

        rgb
    }
}

/// Read one sample from a YUV plane; 10/12-bit content is stored as u16.
#[inline]
fn read_sample(ptr: *const u8, stride: isize, x: u32, y: u32, bpc: u32) -> f32 {
    if bpc <= 8 {
        (unsafe { *ptr.offset(y as isize * stride + x as isize) }) as f32
    } else {
        let byte_offset = y as isize * stride + x as isize * 2;
        (unsafe { *(ptr.offset(byte_offset) as *const u16) }) as f32
    }
}

/// Collapse exotic pixel layouts to RGB8 or RGBA8, which every encoder accepts.
fn to_8bit(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other if other.color().has_alpha() => DynamicImage::ImageRgba8(other.into_rgba8()),
        other => DynamicImage::ImageRgb8(other.into_rgb8()),
    }
}

/// Encode an owned image. Callers pass a detached copy.
fn encode_image(img: DynamicImage, format: Format, quality: Quality) -> Result<Vec<u8>, BackendError> {
    let encode_error = |reason: String| BackendError::Encode { format, reason };
    let q = quality.value() as u8;
    let mut buf = Vec::new();

    match format {
        Format::Jpeg => {
            // JPEG has no alpha channel
            let rgb = DynamicImage::ImageRgb8(img.into_rgb8());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, q))
                .map_err(|e| encode_error(e.to_string()))?;
        }
        Format::Png => {
            to_8bit(img)
                .write_with_encoder(PngEncoder::new(&mut buf))
                .map_err(|e| encode_error(e.to_string()))?;
        }
        Format::Gif => {
            let mut encoder = GifEncoder::new(&mut buf);
            encoder
                .encode_frame(Frame::new(img.into_rgba8()))
                .map_err(|e| encode_error(e.to_string()))?;
        }
        Format::WebP => {
            let img = to_8bit(img);
            let encoder = webp::Encoder::from_image(&img).map_err(|e| encode_error(e.to_string()))?;
            buf = encoder.encode(quality.value() as f32).to_vec();
        }
        Format::Avif => {
            to_8bit(img)
                .write_with_encoder(AvifEncoder::new_with_speed_quality(&mut buf, AVIF_SPEED, q))
                .map_err(|e| encode_error(e.to_string()))?;
        }
    }

    Ok(buf)
}

impl ImageBackend for RustBackend {
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
        if is_avif(path) {
            return identify_avif(path);
        }
        let (width, height) = image::image_dimensions(path).map_err(|e| match e {
            image::ImageError::IoError(io) => BackendError::Io(io),
            other => decode_error(path, other),
        })?;
        Ok(Dimensions { width, height })
    }

    fn decode(&self, path: &Path) -> Result<ImageHandle, BackendError> {
        let img = load_image(path)?;
        if img.width() == 0 || img.height() == 0 {
            return Err(decode_error(path, "image has no pixels"));
        }
        Ok(ImageHandle::new(img))
    }

    fn resize(
        &self,
        image: ImageHandle,
        target: ResolvedDimensions,
        mode: Mode,
    ) -> Result<ImageHandle, BackendError> {
        if target.width == 0 || target.height == 0 {
            return Err(BackendError::ProcessingFailed(format!(
                "Invalid target size {}x{}",
                target.width, target.height
            )));
        }
        let src = image.dimensions();
        let src = (src.width, src.height);
        let box_ = (target.width, target.height);
        let img = image.into_image();

        let out = match mode {
            Mode::Cover => {
                let (fill_w, fill_h) = calculate_fill_dimensions(src, box_);
                let filled = if (fill_w, fill_h) == src {
                    img
                } else {
                    img.resize_exact(fill_w, fill_h, FilterType::Lanczos3)
                };
                let (x, y) = center_crop_offset((fill_w, fill_h), box_);
                if (x, y) == (0, 0) && (fill_w, fill_h) == box_ {
                    filled
                } else {
                    filled.crop_imm(x, y, target.width, target.height)
                }
            }
            Mode::Fit => {
                let (fit_w, fit_h) = calculate_fit_dimensions(src, box_);
                if (fit_w, fit_h) == src {
                    img
                } else {
                    img.resize_exact(fit_w, fit_h, FilterType::Lanczos3)
                }
            }
        };

        Ok(ImageHandle::new(out))
    }

    fn encode(
        &self,
        image: &ImageHandle,
        format: Format,
        quality: Quality,
    ) -> Result<Vec<u8>, BackendError> {
        image.detached(|img| encode_image(img, format, quality))
    }
}
