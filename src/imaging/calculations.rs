//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

use super::params::{Dimensions, ResolvedDimensions};

/// Fill in a missing target side from the source aspect ratio.
///
/// - Both sides requested: returned unchanged, no ratio correction (the
///   resize mode decides between cropping and letterboxing).
/// - Only width: `height = round(width / (natural_w / natural_h))`.
/// - Only height: `width = round(height * (natural_w / natural_h))`.
/// - Neither: the natural dimensions.
///
/// `natural.height` must be non-zero; decoded images always satisfy this.
///
/// # Examples
/// ```
/// # use variant_forge::imaging::{Dimensions, ResolvedDimensions, resolve_dimensions};
/// let natural = Dimensions { width: 1600, height: 1200 };
/// assert_eq!(
///     resolve_dimensions(natural, Some(800), None),
///     ResolvedDimensions { width: 800, height: 600 }
/// );
/// ```
pub fn resolve_dimensions(
    natural: Dimensions,
    width: Option<u32>,
    height: Option<u32>,
) -> ResolvedDimensions {
    let aspect = natural.width as f64 / natural.height as f64;

    match (width, height) {
        (Some(width), Some(height)) => ResolvedDimensions { width, height },
        (Some(width), None) => ResolvedDimensions {
            width,
            height: ((width as f64 / aspect).round() as u32).max(1),
        },
        (None, Some(height)) => ResolvedDimensions {
            width: ((height as f64 * aspect).round() as u32).max(1),
            height,
        },
        (None, None) => ResolvedDimensions {
            width: natural.width,
            height: natural.height,
        },
    }
}

/// Calculate dimensions needed to fill a target area (resize before crop).
///
/// Returns dimensions that completely cover the target area while maintaining
/// the source aspect ratio. One dimension will match exactly, the other may exceed.
pub fn calculate_fill_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let src_aspect = src_w as f64 / src_h as f64;
    let tgt_aspect = tgt_w as f64 / tgt_h as f64;

    if src_aspect > tgt_aspect {
        // Source is wider: height will match, width will exceed
        let h = tgt_h;
        let w = ((h as f64 * src_aspect).round() as u32).max(tgt_w);
        (w, h)
    } else {
        // Source is taller: width will match, height will exceed
        let w = tgt_w;
        let h = ((w as f64 / src_aspect).round() as u32).max(tgt_h);
        (w, h)
    }
}

/// Calculate dimensions that fit inside a target area without cropping.
///
/// The result keeps the source aspect ratio; one side matches the target
/// exactly and the other is less than or equal to it.
pub fn calculate_fit_dimensions(source: (u32, u32), target: (u32, u32)) -> (u32, u32) {
    let (src_w, src_h) = source;
    let (tgt_w, tgt_h) = target;

    let ratio = (tgt_w as f64 / src_w as f64).min(tgt_h as f64 / src_h as f64);
    let w = ((src_w as f64 * ratio).round() as u32).clamp(1, tgt_w);
    let h = ((src_h as f64 * ratio).round() as u32).clamp(1, tgt_h);
    (w, h)
}

/// Top-left offset of a centered `crop` window inside `filled`.
pub fn center_crop_offset(filled: (u32, u32), crop: (u32, u32)) -> (u32, u32) {
    (
        filled.0.saturating_sub(crop.0) / 2,
        filled.1.saturating_sub(crop.1) / 2,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHOTO: Dimensions = Dimensions {
        width: 1600,
        height: 1200,
    };

    // =========================================================================
    // resolve_dimensions tests
    // =========================================================================

    #[test]
    fn resolve_keeps_both_sides_without_ratio_correction() {
        assert_eq!(
            resolve_dimensions(PHOTO, Some(800), Some(400)),
            ResolvedDimensions {
                width: 800,
                height: 400
            }
        );
    }

    #[test]
    fn resolve_derives_height_from_width() {
        // 4:3 source, 800 wide → 600 high
        assert_eq!(
            resolve_dimensions(PHOTO, Some(800), None),
            ResolvedDimensions {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn resolve_derives_width_from_height() {
        let natural = Dimensions {
            width: 800,
            height: 400,
        };
        assert_eq!(
            resolve_dimensions(natural, None, Some(200)),
            ResolvedDimensions {
                width: 400,
                height: 200
            }
        );
    }

    #[test]
    fn resolve_rounds_to_nearest() {
        // 1000x333: height for width 400 is 133.2 → 133
        let natural = Dimensions {
            width: 1000,
            height: 333,
        };
        assert_eq!(resolve_dimensions(natural, Some(400), None).height, 133);
        // width for height 100 is 300.3 → 300
        assert_eq!(resolve_dimensions(natural, None, Some(100)).width, 300);
    }

    #[test]
    fn resolve_without_request_uses_natural_size() {
        assert_eq!(
            resolve_dimensions(PHOTO, None, None),
            ResolvedDimensions {
                width: 1600,
                height: 1200
            }
        );
    }

    #[test]
    fn resolve_never_collapses_to_zero() {
        let sliver = Dimensions {
            width: 4000,
            height: 10,
        };
        assert_eq!(resolve_dimensions(sliver, Some(20), None).height, 1);
    }

    // =========================================================================
    // calculate_fill_dimensions tests
    // =========================================================================

    #[test]
    fn fill_wider_source_to_portrait_target() {
        // 800x600 (4:3) → 400x500 target
        // Source is wider, so height matches: 500, width = 500 * (4/3) = 667
        assert_eq!(calculate_fill_dimensions((800, 600), (400, 500)), (667, 500));
    }

    #[test]
    fn fill_taller_source_to_landscape_target() {
        assert_eq!(calculate_fill_dimensions((600, 800), (500, 400)), (500, 667));
    }

    #[test]
    fn fill_same_aspect_ratio() {
        assert_eq!(calculate_fill_dimensions((800, 600), (400, 300)), (400, 300));
    }

    #[test]
    fn fill_upscales_small_sources() {
        assert_eq!(calculate_fill_dimensions((100, 50), (400, 400)), (800, 400));
    }

    // =========================================================================
    // calculate_fit_dimensions tests
    // =========================================================================

    #[test]
    fn fit_landscape_into_square() {
        assert_eq!(calculate_fit_dimensions((1600, 1200), (400, 400)), (400, 300));
    }

    #[test]
    fn fit_portrait_into_landscape_box() {
        assert_eq!(calculate_fit_dimensions((600, 800), (800, 400)), (300, 400));
    }

    #[test]
    fn fit_exact_box_is_identity_ratio() {
        assert_eq!(calculate_fit_dimensions((1600, 1200), (800, 600)), (800, 600));
    }

    // =========================================================================
    // center_crop_offset tests
    // =========================================================================

    #[test]
    fn crop_offset_centers_overflow() {
        assert_eq!(center_crop_offset((667, 500), (400, 500)), (133, 0));
        assert_eq!(center_crop_offset((500, 667), (500, 400)), (0, 133));
    }

    #[test]
    fn crop_offset_without_overflow_is_origin() {
        assert_eq!(center_crop_offset((400, 300), (400, 300)), (0, 0));
    }
}
