// src/engine/pipeline.rs
//
// Operation pipeline: applies an OperationList to a decoded region.
//
// Stage order is fixed: normalize at source depth, depth reduction, crop
// (unless the reader already cropped), redactions, then the remaining
// operations in list order.
// The raster arrives in the source's stored orientation; the orientation
// correction stays pending until a Rotate absorbs it or the pipeline ends.

use crate::engine::color;
use crate::engine::config::ProcessorConfig;
use crate::engine::overlay;
use crate::engine::raster::Raster;
use crate::engine::reduction::ReductionFactor;
use crate::engine::region::ReaderHints;
use crate::engine::resize;
use crate::error::LazyRegionError;
use crate::ops::{
    Color, Dimension, Operation, OperationList, Orientation, Rect, Redaction, Rotate, Scale,
    Sharpen, Transpose,
};
use image::{DynamicImage, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use std::time::Instant;
use tracing::debug;

// Type alias for Result - always use LazyRegionError to preserve error taxonomy
type PipelineResult<T> = std::result::Result<T, LazyRegionError>;

/// Below this many pixels on a side, resampling filters have no kernel
/// footprint to work with.
pub const MIN_RESAMPLE_DIMENSION: u32 = 3;

const SHARPEN_SIGMA: f32 = 1.0;
const RIGHT_ANGLE_EPSILON: f64 = 1e-6;

/// Pipeline state between stages.
struct StageState {
    raster: Raster,
    /// Orientation correction not yet applied to the pixels
    pending: Orientation,
    /// Raster axes are swapped relative to the display crop
    swapped: bool,
    /// An arbitrary-angle rotation expanded the canvas; the display crop no
    /// longer describes the raster
    rotated: bool,
}

pub struct Pipeline<'c> {
    config: &'c ProcessorConfig,
}

impl<'c> Pipeline<'c> {
    pub fn new(config: &'c ProcessorConfig) -> Self {
        Self { config }
    }

    /// Run `ops` over `raster`.
    ///
    /// `full_size` is the stored full-resolution size, `reduction` the total
    /// reduction the raster carries relative to it, and `orientation` the
    /// correction that makes stored pixels upright.
    pub fn run(
        &self,
        mut raster: Raster,
        ops: &OperationList,
        full_size: Dimension,
        reduction: ReductionFactor,
        hints: ReaderHints,
        orientation: Orientation,
    ) -> PipelineResult<Raster> {
        let started = Instant::now();
        let orientation = if hints.contains(ReaderHints::ALREADY_ORIENTED) {
            Orientation::Rotate0
        } else {
            orientation
        };

        if ops.wants_normalize() || self.config.normalize {
            if raster.indexed {
                debug!(target: "lazy_region::pipeline", "skipping normalize on indexed raster");
            } else {
                raster = color::normalize(raster);
            }
        }
        raster = color::reduce_to_8_bits(raster);

        let stored_crop = ops.crop().to_stored(full_size, orientation);
        let crop_rect = stored_crop.rectangle(full_size);

        if !hints.contains(ReaderHints::ALREADY_CROPPED) && stored_crop.has_effect(full_size) {
            let reduced = Dimension::from_u32(raster.width(), raster.height());
            let rect = stored_crop.rectangle_reduced(reduced, reduction);
            raster = crop_raster(raster, &rect);
        }

        raster = self.redact(raster, ops, full_size, &crop_rect, reduction, orientation);

        let display_full = orientation.oriented_size(full_size);
        let display_crop = ops.crop().rectangle(display_full).size();

        let mut state = StageState {
            raster,
            pending: orientation,
            swapped: orientation.swaps_axes(),
            rotated: false,
        };

        // Scale is a singleton: only the last one in the list runs.
        let last_scale = ops
            .iter()
            .rposition(|op| matches!(op, Operation::Scale(_)));

        for (index, op) in ops.iter().enumerate() {
            if !op.has_effect(display_full, ops) {
                continue;
            }
            if matches!(op, Operation::Scale(_)) && Some(index) != last_scale {
                continue;
            }
            state = match op {
                Operation::Crop(_)
                | Operation::Redaction(_)
                | Operation::Encode(_)
                | Operation::Normalize => state,
                Operation::Scale(scale) => self.scale(state, scale, display_crop, reduction)?,
                Operation::Transpose(transpose) => apply_transpose(state, *transpose),
                Operation::Rotate(rotate) => apply_rotate(state, rotate),
                Operation::ColorTransform(transform) => StageState {
                    raster: color::transform(state.raster, *transform),
                    ..state
                },
                Operation::Sharpen(sharpen) => StageState {
                    raster: sharpen_raster(state.raster, sharpen),
                    ..state
                },
                Operation::Overlay(o) => {
                    let state = flush_orientation(state);
                    StageState {
                        raster: overlay::apply(state.raster, o),
                        ..state
                    }
                }
            };
        }

        let state = flush_orientation(state);
        debug!(
            target: "lazy_region::pipeline",
            width = state.raster.width(),
            height = state.raster.height(),
            factor = reduction.factor(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(state.raster)
    }

    fn redact(
        &self,
        raster: Raster,
        ops: &OperationList,
        full_size: Dimension,
        crop_rect: &Rect,
        reduction: ReductionFactor,
        orientation: Orientation,
    ) -> Raster {
        let mut redactions = ops.redactions().filter(|r| r.has_effect()).peekable();
        if redactions.peek().is_none() {
            return raster;
        }
        let mut image = raster.image.clone();
        let mut drawn = 0usize;
        for redaction in redactions {
            let stored = orientation.unrotate_rect(redaction.region, full_size);
            let local = Redaction { region: stored }
                .resulting_region(crop_rect)
                .scaled(reduction.scale());
            if local.is_empty() || local.int_width() == 0 || local.int_height() == 0 {
                debug!(
                    target: "lazy_region::pipeline",
                    region = %redaction.region,
                    "redaction outside the cropped region; skipping"
                );
                continue;
            }
            let rect = imageproc::rect::Rect::at(local.int_x() as i32, local.int_y() as i32)
                .of_size(local.int_width(), local.int_height());
            draw_filled_rect_mut(&mut image, rect, Color::BLACK.to_rgba());
            drawn += 1;
        }
        if drawn == 0 {
            return raster;
        }
        debug!(target: "lazy_region::pipeline", count = drawn, "applied redactions");
        raster.with_image(image)
    }

    fn scale(
        &self,
        state: StageState,
        scale: &Scale,
        display_crop: Dimension,
        reduction: ReductionFactor,
    ) -> PipelineResult<StageState> {
        let (tw, th) = if state.rotated {
            // Rotated canvas in full-resolution terms.
            let factor = reduction.scale();
            scale.resulting_size(Dimension::new(
                state.raster.width() as f64 / factor,
                state.raster.height() as f64 / factor,
            ))
        } else {
            let (tw, th) = scale.resulting_size(display_crop);
            if state.swapped {
                (th, tw)
            } else {
                (tw, th)
            }
        };
        let raster = state.raster;
        if raster.dimensions() == (tw, th) {
            return Ok(StageState { raster, ..state });
        }

        if tw < MIN_RESAMPLE_DIMENSION || th < MIN_RESAMPLE_DIMENSION {
            debug!(
                target: "lazy_region::pipeline",
                width = tw,
                height = th,
                "target below minimum resample size; using placeholder"
            );
            return Ok(StageState {
                raster: Raster::blank(tw, th),
                ..state
            });
        }

        let upscale = tw > raster.width() || th > raster.height();
        let filter = self.config.filter_for(scale.filter, upscale);
        let linear = !upscale && filter.is_linear();
        let started = Instant::now();
        let (sw, sh) = raster.dimensions();
        let resized = resize::resize(raster.image.clone(), tw, th, filter, linear)?;
        debug!(
            target: "lazy_region::pipeline",
            from_width = sw,
            from_height = sh,
            width = tw,
            height = th,
            filter = filter.name(),
            linear,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scaled"
        );
        let mut raster = raster.with_image(resized);
        if self.config.sharpen > 0.0 {
            raster = sharpen_raster(
                raster,
                &Sharpen {
                    amount: self.config.sharpen,
                },
            );
        }
        Ok(StageState { raster, ..state })
    }
}

fn crop_raster(raster: Raster, rect: &Rect) -> Raster {
    let (w, h) = raster.dimensions();
    let x = rect.int_x().min(w.saturating_sub(1));
    let y = rect.int_y().min(h.saturating_sub(1));
    let cw = rect.int_width().clamp(1, w - x);
    let ch = rect.int_height().clamp(1, h - y);
    if (x, y, cw, ch) == (0, 0, w, h) {
        return raster;
    }
    debug!(target: "lazy_region::pipeline", x, y, width = cw, height = ch, "cropped");
    let image = raster.image.crop_imm(x, y, cw, ch);
    raster.with_image(image)
}

fn apply_transpose(state: StageState, transpose: Transpose) -> StageState {
    let transpose = transpose.to_stored(state.pending);
    let image = match transpose {
        Transpose::Horizontal => state.raster.image.fliph(),
        Transpose::Vertical => state.raster.image.flipv(),
    };
    StageState {
        raster: state.raster.with_image(image),
        ..state
    }
}

fn apply_rotate(state: StageState, rotate: &Rotate) -> StageState {
    let total = (rotate.normalized() + state.pending.degrees() as f64).rem_euclid(360.0);
    let quarter_turns = total / 90.0;
    let right_angle = (quarter_turns - quarter_turns.round()).abs() < RIGHT_ANGLE_EPSILON;
    let swapped = if right_angle {
        // Display axes now follow the requested rotation alone.
        rotate_quarters(rotate.normalized()) % 2 == 1
    } else {
        false
    };
    StageState {
        raster: rotate_raster(state.raster, total),
        pending: Orientation::Rotate0,
        swapped,
        rotated: state.rotated || !right_angle,
    }
}

fn rotate_quarters(degrees: f64) -> u32 {
    ((degrees.rem_euclid(360.0) / 90.0).round() as u32) % 4
}

fn flush_orientation(state: StageState) -> StageState {
    if state.pending == Orientation::Rotate0 {
        return state;
    }
    debug!(
        target: "lazy_region::pipeline",
        degrees = state.pending.degrees(),
        "applying source orientation"
    );
    StageState {
        raster: rotate_raster(state.raster, state.pending.degrees() as f64),
        pending: Orientation::Rotate0,
        swapped: false,
        rotated: state.rotated,
    }
}

/// Rotate clockwise. Right angles are exact; other angles expand the canvas
/// to the rotated bounding box, sample bilinearly and fill with transparency.
pub fn rotate_raster(raster: Raster, degrees: f64) -> Raster {
    let degrees = degrees.rem_euclid(360.0);
    let quarters = degrees / 90.0;
    if (quarters - quarters.round()).abs() < RIGHT_ANGLE_EPSILON {
        let image = match rotate_quarters(degrees) {
            0 => return raster,
            1 => raster.image.rotate90(),
            2 => raster.image.rotate180(),
            _ => raster.image.rotate270(),
        };
        return raster.with_image(image);
    }

    let started = Instant::now();
    let (w, h) = raster.dimensions();
    let radians = degrees.to_radians();
    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
    let new_w = ((w as f64 * cos + h as f64 * sin).round() as u32).max(1);
    let new_h = ((h as f64 * cos + w as f64 * sin).round() as u32).max(1);

    // Work on a canvas large enough for both the source and the result so
    // nothing is clipped before rotation.
    let canvas_w = w.max(new_w);
    let canvas_h = h.max(new_h);
    let mut canvas = RgbaImage::new(canvas_w, canvas_h);
    image::imageops::replace(
        &mut canvas,
        &raster.image.to_rgba8(),
        ((canvas_w - w) / 2) as i64,
        ((canvas_h - h) / 2) as i64,
    );
    let rotated = rotate_about_center(
        &canvas,
        radians as f32,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
    );
    let out = image::imageops::crop_imm(
        &rotated,
        (canvas_w - new_w) / 2,
        (canvas_h - new_h) / 2,
        new_w,
        new_h,
    )
    .to_image();

    debug!(
        target: "lazy_region::pipeline",
        degrees,
        width = new_w,
        height = new_h,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "rotated"
    );
    raster.with_image(DynamicImage::ImageRgba8(out))
}

/// Unsharp mask over the color channels.
pub fn sharpen_raster(raster: Raster, sharpen: &Sharpen) -> Raster {
    if !sharpen.has_effect() {
        return raster;
    }
    let (w, h) = raster.dimensions();
    if w < MIN_RESAMPLE_DIMENSION || h < MIN_RESAMPLE_DIMENSION {
        debug!(target: "lazy_region::pipeline", width = w, height = h, "raster too small to sharpen");
        return raster;
    }
    let had_alpha = raster.has_alpha();
    let source = raster.image.to_rgba8();
    let blurred = gaussian_blur_f32(&source, SHARPEN_SIGMA);
    let amount = sharpen.amount as f32;
    let mut out = source.clone();
    for (dst, (orig, blur)) in out
        .pixels_mut()
        .zip(source.pixels().zip(blurred.pixels()))
    {
        for c in 0..3 {
            let o = orig[c] as f32;
            dst[c] = (o + amount * (o - blur[c] as f32)).round().clamp(0.0, 255.0) as u8;
        }
    }
    let image = DynamicImage::ImageRgba8(out);
    let image = if had_alpha {
        image
    } else {
        DynamicImage::ImageRgb8(image.to_rgb8())
    };
    raster.with_image(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{ColorTransform, Crop};
    use image::{GenericImageView, ImageBuffer, Luma, Rgb, RgbImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn run(
        raster: Raster,
        ops: &OperationList,
        full: (u32, u32),
        rf: u32,
        hints: ReaderHints,
        orientation: Orientation,
    ) -> Raster {
        let config = ProcessorConfig::default();
        Pipeline::new(&config)
            .run(
                raster,
                ops,
                Dimension::from_u32(full.0, full.1),
                ReductionFactor::new(rf),
                hints,
                orientation,
            )
            .unwrap()
    }

    mod stage_tests {
        use super::*;

        #[test]
        fn test_empty_list_is_identity() {
            let img = create_test_image(16, 9);
            let out = run(
                Raster::new(img.clone()),
                &OperationList::default(),
                (16, 9),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.image.to_rgb8(), img.to_rgb8());
        }

        #[test]
        fn test_normalize_runs_before_depth_reduction() {
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(256, 1, |x, _| Luma([1000 + x as u16]));
            let ops = OperationList::default().with(Operation::Normalize);
            let out = run(
                Raster::new(DynamicImage::ImageLuma16(img)),
                &ops,
                (256, 1),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.sample_depth(), 8);
            let gray = out.image.to_luma8();
            let levels: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
            assert_eq!(levels, (0..=255u8).collect::<Vec<_>>());
        }

        #[test]
        fn test_normalize_rgb16_source() {
            let img: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_fn(256, 1, |x, _| {
                Rgb([2000 + x as u16, 40000 - x as u16, 7 * 257])
            });
            let ops = OperationList::default().with(Operation::Normalize);
            let out = run(
                Raster::new(DynamicImage::ImageRgb16(img)),
                &ops,
                (256, 1),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            let rgb = out.image.to_rgb8();
            assert_eq!(rgb.get_pixel(0, 0).0, [0, 255, 7]);
            assert_eq!(rgb.get_pixel(255, 0).0, [255, 0, 7]);
            assert_eq!(rgb.get_pixel(128, 0).0, [128, 127, 7]);
        }

        #[test]
        fn test_normalize_skips_indexed_raster() {
            let img = DynamicImage::ImageRgb8(RgbImage::from_fn(4, 1, |x, _| {
                Rgb([100 + x as u8, 100, 100])
            }));
            let ops = OperationList::default().with(Operation::Normalize);
            let out = run(
                Raster::indexed(img.clone()),
                &ops,
                (4, 1),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.image.to_rgb8(), img.to_rgb8());
        }

        #[test]
        fn test_crop_skipped_when_already_cropped() {
            let ops = OperationList::default().with(Operation::Crop(Crop::pixels(2, 2, 4, 4)));
            let out = run(
                Raster::new(create_test_image(10, 10)),
                &ops,
                (10, 10),
                0,
                ReaderHints::ALREADY_CROPPED,
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (10, 10));
        }

        #[test]
        fn test_crop_rescaled_by_reduction() {
            // 20x20 full image delivered at half resolution
            let ops = OperationList::default().with(Operation::Crop(Crop::pixels(4, 6, 8, 8)));
            let out = run(
                Raster::new(create_test_image(10, 10)),
                &ops,
                (20, 20),
                1,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (4, 4));
            assert_eq!(out.image.to_rgb8().get_pixel(0, 0).0, [2, 3, 128]);
        }

        #[test]
        fn test_redaction_is_drawn_relative_to_crop() {
            let ops = OperationList::default()
                .with(Operation::Crop(Crop::pixels(10, 10, 20, 20)))
                .with(Operation::Redaction(Redaction::new(12, 12, 4, 4)));
            let out = run(
                Raster::new(create_test_image(20, 20)),
                &ops,
                (100, 100),
                0,
                ReaderHints::ALREADY_CROPPED,
                Orientation::Rotate0,
            );
            let rgb = out.image.to_rgb8();
            assert_eq!(rgb.get_pixel(2, 2).0, [0, 0, 0]);
            assert_eq!(rgb.get_pixel(5, 5).0, [0, 0, 0]);
            assert_eq!(rgb.get_pixel(6, 6).0, [6, 6, 128]);
        }

        #[test]
        fn test_redaction_outside_crop_is_skipped() {
            let ops = OperationList::default()
                .with(Operation::Crop(Crop::pixels(0, 0, 10, 10)))
                .with(Operation::Redaction(Redaction::new(50, 50, 5, 5)));
            let img = create_test_image(10, 10);
            let out = run(
                Raster::new(img.clone()),
                &ops,
                (100, 100),
                0,
                ReaderHints::ALREADY_CROPPED,
                Orientation::Rotate0,
            );
            assert_eq!(out.image.to_rgb8(), img.to_rgb8());
        }

        #[test]
        fn test_scale_targets_crop_size() {
            let ops = OperationList::default()
                .with(Operation::Crop(Crop::pixels(0, 0, 400, 200)))
                .with(Operation::Scale(Scale::fit_width(100)));
            // Reader delivered the crop at factor 1 (200x100)
            let out = run(
                Raster::new(create_test_image(200, 100)),
                &ops,
                (800, 600),
                1,
                ReaderHints::ALREADY_CROPPED,
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (100, 50));
        }

        #[test]
        fn test_tiny_target_yields_placeholder() {
            let ops = OperationList::default().with(Operation::Scale(Scale::exact(2, 40)));
            let out = run(
                Raster::new(create_test_image(100, 100)),
                &ops,
                (100, 100),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (2, 40));
            assert_eq!(out.channels(), 4);
            assert_eq!(out.image.to_rgba8().get_pixel(1, 1).0, [0, 0, 0, 0]);
        }

        #[test]
        fn test_color_transform_and_transpose() {
            let ops = OperationList::default()
                .with(Operation::Transpose(Transpose::Horizontal))
                .with(Operation::ColorTransform(ColorTransform::Gray));
            let out = run(
                Raster::new(create_test_image(4, 2)),
                &ops,
                (4, 2),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            let rgba = out.image.to_rgba8();
            // original pixel (3,0) = [3,0,128] -> 0.63 + 8.96 -> 9
            assert_eq!(rgba.get_pixel(0, 0).0, [9, 9, 9, 255]);
        }
    }

    mod orientation_tests {
        use super::*;

        #[test]
        fn test_orientation_applied_at_end() {
            let out = run(
                Raster::new(create_test_image(6, 4)),
                &OperationList::default(),
                (6, 4),
                0,
                ReaderHints::empty(),
                Orientation::Rotate90,
            );
            assert_eq!(out.dimensions(), (4, 6));
            // stored (0, 3) lands at display (0, 0) after a clockwise turn
            assert_eq!(out.image.to_rgb8().get_pixel(0, 0).0, [0, 3, 128]);
        }

        #[test]
        fn test_already_oriented_hint_ignores_orientation() {
            let out = run(
                Raster::new(create_test_image(6, 4)),
                &OperationList::default(),
                (6, 4),
                0,
                ReaderHints::ALREADY_ORIENTED,
                Orientation::Rotate90,
            );
            assert_eq!(out.dimensions(), (6, 4));
        }

        #[test]
        fn test_rotate_absorbs_orientation() {
            let ops = OperationList::default().with(Operation::Rotate(Rotate::new(270.0)));
            let img = create_test_image(6, 4);
            let out = run(
                Raster::new(img.clone()),
                &ops,
                (6, 4),
                0,
                ReaderHints::empty(),
                Orientation::Rotate90,
            );
            assert_eq!(out.image.to_rgb8(), img.to_rgb8());
        }

        #[test]
        fn test_scale_on_rotated_source_uses_display_axes() {
            // Stored 200x100, displayed 100x200
            let ops = OperationList::default().with(Operation::Scale(Scale::fit_width(50)));
            let out = run(
                Raster::new(create_test_image(200, 100)),
                &ops,
                (200, 100),
                0,
                ReaderHints::empty(),
                Orientation::Rotate90,
            );
            assert_eq!(out.dimensions(), (50, 100));
        }

        #[test]
        fn test_display_crop_maps_to_stored_pixels() {
            // Display is 4x6; crop its top-left 2x2
            let ops = OperationList::default().with(Operation::Crop(Crop::pixels(0, 0, 2, 2)));
            let out = run(
                Raster::new(create_test_image(6, 4)),
                &ops,
                (6, 4),
                0,
                ReaderHints::empty(),
                Orientation::Rotate90,
            );
            assert_eq!(out.dimensions(), (2, 2));
            assert_eq!(out.image.to_rgb8().get_pixel(0, 0).0, [0, 3, 128]);
        }
    }

    mod rotate_tests {
        use super::*;

        #[test]
        fn test_arbitrary_rotation_expands_canvas() {
            let out = rotate_raster(Raster::new(create_test_image(100, 50)), 45.0);
            let expected = ((100.0 + 50.0) * std::f64::consts::FRAC_1_SQRT_2).round() as u32;
            assert_eq!(out.dimensions(), (expected, expected));
            assert_eq!(out.channels(), 4);
            // Corners fall outside the rotated source
            assert_eq!(out.image.get_pixel(0, 0).0[3], 0);
        }

        #[test]
        fn test_scale_after_arbitrary_rotation_uses_rotated_extent() {
            let ops = OperationList::default()
                .with(Operation::Rotate(Rotate::new(45.0)))
                .with(Operation::Scale(Scale::fit_width(50)));
            let out = run(
                Raster::new(create_test_image(100, 50)),
                &ops,
                (100, 50),
                0,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (50, 50));
        }

        #[test]
        fn test_scale_after_arbitrary_rotation_on_reduced_raster() {
            // 200x100 source delivered at half resolution
            let ops = OperationList::default()
                .with(Operation::Rotate(Rotate::new(45.0)))
                .with(Operation::Scale(Scale::percent(0.25)));
            let out = run(
                Raster::new(create_test_image(100, 50)),
                &ops,
                (200, 100),
                1,
                ReaderHints::empty(),
                Orientation::Rotate0,
            );
            assert_eq!(out.dimensions(), (53, 53));
        }

        #[test]
        fn test_negative_right_angle() {
            let out = rotate_raster(Raster::new(create_test_image(6, 4)), -90.0);
            assert_eq!(out.dimensions(), (4, 6));
            assert_eq!(out.image.to_rgb8().get_pixel(0, 0).0, [5, 0, 128]);
        }
    }

    mod sharpen_tests {
        use super::*;

        #[test]
        fn test_sharpen_increases_edge_contrast() {
            let img = RgbImage::from_fn(10, 10, |x, _| if x < 5 { Rgb([100; 3]) } else { Rgb([150; 3]) });
            let out = sharpen_raster(
                Raster::new(DynamicImage::ImageRgb8(img)),
                &Sharpen { amount: 1.0 },
            );
            let rgb = out.image.to_rgb8();
            assert!(rgb.get_pixel(4, 5).0[0] < 100);
            assert!(rgb.get_pixel(5, 5).0[0] > 150);
            assert_eq!(out.channels(), 3);
        }

        #[test]
        fn test_sharpen_skips_tiny_rasters() {
            let img = create_test_image(2, 2);
            let out = sharpen_raster(Raster::new(img.clone()), &Sharpen { amount: 2.0 });
            assert_eq!(out.image.to_rgb8(), img.to_rgb8());
        }
    }
}
