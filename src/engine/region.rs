// src/engine/region.rs
//
// Region planning: rebases the requested crop into the selected level's
// coordinates and adds a subsampling stride that approaches, but never
// undershoots, the requested output scale.

use crate::engine::decoder::{DecodedRaster, DecoderBackend};
use crate::engine::pyramid::DecompositionLevel;
use crate::engine::reduction::ReductionFactor;
use crate::error::LazyRegionError;
use crate::ops::{Crop, Dimension, Scale};
use bitflags::bitflags;
use image::{DynamicImage, GenericImageView};
use std::time::Instant;
use tracing::debug;

type RegionResult<T> = std::result::Result<T, LazyRegionError>;

bitflags! {
    /// Facts a backend or the planner reports about a returned raster.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ReaderHints: u8 {
        /// The raster already covers exactly the requested region
        const ALREADY_CROPPED = 1 << 0;
        /// The raster is already upright; source orientation must be ignored
        const ALREADY_ORIENTED = 1 << 1;
    }
}

/// Rectangle in the coordinate space of one level, plus a subsample stride
/// (1 = every pixel, 2 = every other pixel, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub subsample: u32,
}

impl DecodeRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            subsample: 1,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn with_subsample(mut self, subsample: u32) -> Self {
        self.subsample = subsample.max(1);
        self
    }

    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width >= width && self.height >= height
    }

    /// Size of the raster a backend returns for this region.
    pub fn output_size(&self) -> (u32, u32) {
        let stride = self.subsample.max(1);
        (self.width.div_ceil(stride), self.height.div_ceil(stride))
    }
}

impl std::fmt::Display for DecodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{} {}x{} /{}",
            self.x, self.y, self.width, self.height, self.subsample
        )
    }
}

/// Everything computed before any pixel data is touched.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionPlan {
    pub level_index: usize,
    pub level_factor: ReductionFactor,
    pub region: DecodeRegion,
    pub subsample_factor: ReductionFactor,
    pub total_factor: ReductionFactor,
    pub hints: ReaderHints,
}

pub struct RegionReader;

impl RegionReader {
    /// Plan the read of `crop` from `level`, whose reduction relative to
    /// `full` is `level_factor`.
    pub fn plan(
        full: Dimension,
        level: &DecompositionLevel,
        level_factor: ReductionFactor,
        crop: &Crop,
        scale: &Scale,
    ) -> RegionPlan {
        let full_rect = crop.rectangle(full);
        let rebased = full_rect.scaled(level_factor.scale());

        // Edge levels can be a few pixels smaller than an exact halving.
        let x = rebased.int_x().min(level.width.saturating_sub(1));
        let y = rebased.int_y().min(level.height.saturating_sub(1));
        let width = rebased.int_width().clamp(1, (level.width - x).max(1));
        let height = rebased.int_height().clamp(1, (level.height - y).max(1));

        let (sx, sy) = scale.resulting_scales(full_rect.size());
        let x_scale = sx * full_rect.width / width as f64;
        let y_scale = sy * full_rect.height / height as f64;
        let subsample_factor = if x_scale.max(y_scale) < 1.0 {
            ReductionFactor::for_scale_uncapped(x_scale.max(y_scale))
        } else {
            ReductionFactor::default()
        };
        let total_factor = ReductionFactor::combine(level_factor, subsample_factor);

        let region =
            DecodeRegion::new(x, y, width, height).with_subsample(subsample_factor.stride());

        debug!(
            target: "lazy_region::region",
            level = level.index,
            region = %region,
            level_factor = level_factor.factor(),
            subsample_factor = subsample_factor.factor(),
            total_factor = total_factor.factor(),
            "planned region read"
        );

        RegionPlan {
            level_index: level.index,
            level_factor,
            region,
            subsample_factor,
            total_factor,
            hints: ReaderHints::ALREADY_CROPPED,
        }
    }

    /// Read the planned region. Backend failures carry the level and region
    /// they happened at; hints from the backend are merged with the plan's.
    pub fn read(backend: &mut dyn DecoderBackend, plan: &RegionPlan) -> RegionResult<DecodedRaster> {
        let started = Instant::now();
        let decoded = backend
            .read_region(plan.level_index, &plan.region)
            .map_err(|err| match err {
                LazyRegionError::DecodeFailed { message, .. }
                | LazyRegionError::InternalPanic { message } => LazyRegionError::decode_failed(
                    plan.level_index as u32,
                    plan.region.to_string(),
                    message,
                ),
                other => other,
            })?;

        debug!(
            target: "lazy_region::region",
            width = decoded.raster.width(),
            height = decoded.raster.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "region decoded"
        );

        Ok(DecodedRaster {
            raster: decoded.raster,
            hints: decoded.hints | plan.hints,
        })
    }
}

/// Cut `region` out of a decoded level image and apply its stride.
/// Backends that can only decode a whole level use this to honor the
/// region contract.
pub fn extract_region(image: &DynamicImage, region: &DecodeRegion) -> DynamicImage {
    let (w, h) = image.dimensions();
    let x = region.x.min(w.saturating_sub(1));
    let y = region.y.min(h.saturating_sub(1));
    let width = region.width.min(w - x).max(1);
    let height = region.height.min(h - y).max(1);
    let cropped = if x == 0 && y == 0 && width == w && height == h {
        image.clone()
    } else {
        image.crop_imm(x, y, width, height)
    };
    subsample(cropped, region.subsample)
}

/// Keep every `stride`-th pixel on both axes, starting at the origin.
pub fn subsample(image: DynamicImage, stride: u32) -> DynamicImage {
    if stride <= 1 {
        return image;
    }
    let (w, h) = image.dimensions();
    let (ow, oh) = (w.div_ceil(stride).max(1), h.div_ceil(stride).max(1));
    macro_rules! pick {
        ($buf:expr, $variant:path) => {{
            let src = $buf;
            $variant(image::ImageBuffer::from_fn(ow, oh, |x, y| {
                *src.get_pixel(x * stride, y * stride)
            }))
        }};
    }
    match &image {
        DynamicImage::ImageLuma8(buf) => pick!(buf, DynamicImage::ImageLuma8),
        DynamicImage::ImageLumaA8(buf) => pick!(buf, DynamicImage::ImageLumaA8),
        DynamicImage::ImageRgb8(buf) => pick!(buf, DynamicImage::ImageRgb8),
        DynamicImage::ImageRgba8(buf) => pick!(buf, DynamicImage::ImageRgba8),
        DynamicImage::ImageLuma16(buf) => pick!(buf, DynamicImage::ImageLuma16),
        DynamicImage::ImageLumaA16(buf) => pick!(buf, DynamicImage::ImageLumaA16),
        DynamicImage::ImageRgb16(buf) => pick!(buf, DynamicImage::ImageRgb16),
        DynamicImage::ImageRgba16(buf) => pick!(buf, DynamicImage::ImageRgba16),
        DynamicImage::ImageRgb32F(buf) => pick!(buf, DynamicImage::ImageRgb32F),
        DynamicImage::ImageRgba32F(buf) => pick!(buf, DynamicImage::ImageRgba32F),
        _ => {
            let src = image.to_rgba8();
            DynamicImage::ImageRgba8(image::ImageBuffer::from_fn(ow, oh, |x, y| {
                *src.get_pixel(x * stride, y * stride)
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::pyramid::PyramidSelector;
    use image::{Rgb, RgbImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn pyramid() -> Vec<DecompositionLevel> {
        PyramidSelector::levels_from_sizes(&[(4000, 3000), (2000, 1500), (1000, 750), (500, 375)])
    }

    fn full() -> Dimension {
        Dimension::from_u32(4000, 3000)
    }

    mod plan_tests {
        use super::*;

        #[test]
        fn test_cropped_request_rebases_onto_quarter_level() {
            let crop = Crop::pixels(0, 0, 2000, 1500);
            let scale = Scale::fit_width(500);
            let levels = pyramid();
            let sel = PyramidSelector::select(full(), &levels, &crop, &scale);
            let plan = RegionReader::plan(full(), &levels[sel.level_index], sel.factor, &crop, &scale);
            assert_eq!(plan.level_index, 2);
            assert_eq!(plan.level_factor.factor(), 2);
            assert_eq!(plan.region, DecodeRegion::new(0, 0, 500, 375));
            assert_eq!(plan.subsample_factor.factor(), 0);
            assert_eq!(plan.total_factor.factor(), 2);
            assert!(plan.hints.contains(ReaderHints::ALREADY_CROPPED));
        }

        #[test]
        fn test_exact_match_needs_no_subsampling() {
            let scale = Scale::fit_width(500);
            let levels = pyramid();
            let sel = PyramidSelector::select(full(), &levels, &Crop::Full, &scale);
            let plan =
                RegionReader::plan(full(), &levels[sel.level_index], sel.factor, &Crop::Full, &scale);
            assert_eq!(plan.region, DecodeRegion::full(500, 375));
            assert_eq!(plan.subsample_factor.factor(), 0);
            assert_eq!(plan.total_factor.factor(), 3);
        }

        #[test]
        fn test_single_level_source_subsamples() {
            let level = DecompositionLevel::new(0, 4000, 3000);
            let plan = RegionReader::plan(
                full(),
                &level,
                ReductionFactor::default(),
                &Crop::Full,
                &Scale::fit_width(900),
            );
            // 900/4000 = 0.225 -> stride 4 delivers 1000 px, never fewer than 900
            assert_eq!(plan.region.subsample, 4);
            assert_eq!(plan.total_factor.factor(), 2);
            assert!(plan.region.output_size().0 >= 900);
        }

        #[test]
        fn test_region_is_clamped_to_level_bounds() {
            // 4001 wide full image, 2001 wide level: rebased crop runs past it.
            let full = Dimension::from_u32(4001, 3001);
            let level = DecompositionLevel::new(1, 2000, 1500);
            let plan = RegionReader::plan(
                full,
                &level,
                ReductionFactor::new(1),
                &Crop::pixels(3000, 2000, 1001, 1001),
                &Scale::percent(0.5),
            );
            assert_eq!(plan.region.x, 1500);
            assert_eq!(plan.region.y, 1000);
            assert_eq!(plan.region.x + plan.region.width, 2000);
            assert_eq!(plan.region.y + plan.region.height, 1500);
        }

        #[test]
        fn test_upscale_never_subsamples() {
            let level = DecompositionLevel::new(0, 4000, 3000);
            let plan = RegionReader::plan(
                full(),
                &level,
                ReductionFactor::default(),
                &Crop::pixels(0, 0, 100, 100),
                &Scale::fit_width(400),
            );
            assert_eq!(plan.region.subsample, 1);
            assert_eq!(plan.region, DecodeRegion::new(0, 0, 100, 100));
        }
    }

    mod extract_tests {
        use super::*;

        #[test]
        fn test_extract_region_crops_then_strides() {
            let img = create_test_image(10, 10);
            let out = extract_region(&img, &DecodeRegion::new(2, 4, 6, 5).with_subsample(2));
            assert_eq!(out.dimensions(), (3, 3));
            let rgb = out.to_rgb8();
            assert_eq!(rgb.get_pixel(0, 0).0, [2, 4, 128]);
            assert_eq!(rgb.get_pixel(1, 2).0, [4, 8, 128]);
        }

        #[test]
        fn test_extract_region_clamps_to_image() {
            let img = create_test_image(10, 10);
            let out = extract_region(&img, &DecodeRegion::new(8, 8, 50, 50));
            assert_eq!(out.dimensions(), (2, 2));
        }

        #[test]
        fn test_subsample_identity() {
            let img = create_test_image(7, 3);
            let out = subsample(img.clone(), 1);
            assert_eq!(out.to_rgb8(), img.to_rgb8());
        }

        #[test]
        fn test_output_size_matches_subsample() {
            let region = DecodeRegion::new(0, 0, 7, 5).with_subsample(2);
            let out = extract_region(&create_test_image(7, 5), &region);
            assert_eq!(out.dimensions(), region.output_size());
        }
    }
}
