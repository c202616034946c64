// src/engine/color.rs
//
// Photometric stages: sample depth reduction, contrast normalization and
// the gray/bitonal color transforms.

use crate::engine::raster::Raster;
use crate::ops::ColorTransform;
use image::{DynamicImage, GenericImageView, GrayImage, Luma, Rgba, RgbaImage};
use imageproc::contrast::otsu_level;
use std::time::Instant;
use tracing::debug;

/// Convert samples wider than 8 bits to 8 bits, keeping channel layout.
pub fn reduce_to_8_bits(raster: Raster) -> Raster {
    let reduced = match &raster.image {
        DynamicImage::ImageLuma8(_)
        | DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageRgb8(_)
        | DynamicImage::ImageRgba8(_) => return raster,
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma8(raster.image.to_luma8()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLumaA8(raster.image.to_luma_alpha8()),
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgb32F(_) => {
            DynamicImage::ImageRgb8(raster.image.to_rgb8())
        }
        _ => DynamicImage::ImageRgba8(raster.image.to_rgba8()),
    };
    debug!(
        target: "lazy_region::color",
        from = ?raster.color_type(),
        to = ?reduced.color(),
        "reduced sample depth to 8 bits"
    );
    raster.with_image(reduced)
}

/// Stretch each color channel so its darkest sample maps to 0 and its
/// brightest to the full scale of the sample type. Runs at the source depth
/// (8-bit, 16-bit or float); alpha is left alone.
pub fn normalize(raster: Raster) -> Raster {
    let started = Instant::now();
    let has_alpha = raster.has_alpha();
    let channels = raster.channels() as usize;
    let color_channels = if has_alpha { channels - 1 } else { channels };

    let mut image = raster.image.clone();
    let to_u8 = |v: f64| v.round().clamp(0.0, u8::MAX as f64) as u8;
    let to_u16 = |v: f64| v.round().clamp(0.0, u16::MAX as f64) as u16;
    let to_f32 = |v: f64| v.clamp(0.0, 1.0) as f32;
    match &mut image {
        DynamicImage::ImageLuma8(buf) => stretch(buf, channels, color_channels, u8::MAX as f64, to_u8),
        DynamicImage::ImageLumaA8(buf) => stretch(buf, channels, color_channels, u8::MAX as f64, to_u8),
        DynamicImage::ImageRgb8(buf) => stretch(buf, channels, color_channels, u8::MAX as f64, to_u8),
        DynamicImage::ImageRgba8(buf) => stretch(buf, channels, color_channels, u8::MAX as f64, to_u8),
        DynamicImage::ImageLuma16(buf) => stretch(buf, channels, color_channels, u16::MAX as f64, to_u16),
        DynamicImage::ImageLumaA16(buf) => stretch(buf, channels, color_channels, u16::MAX as f64, to_u16),
        DynamicImage::ImageRgb16(buf) => stretch(buf, channels, color_channels, u16::MAX as f64, to_u16),
        DynamicImage::ImageRgba16(buf) => stretch(buf, channels, color_channels, u16::MAX as f64, to_u16),
        DynamicImage::ImageRgb32F(buf) => stretch(buf, channels, color_channels, 1.0, to_f32),
        DynamicImage::ImageRgba32F(buf) => stretch(buf, channels, color_channels, 1.0, to_f32),
        _ => {
            debug!(target: "lazy_region::color", color = ?raster.color_type(), "cannot normalize sample layout");
            return raster;
        }
    }

    debug!(
        target: "lazy_region::color",
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "normalized contrast"
    );
    raster.with_image(image)
}

/// Linear per-channel stretch of interleaved samples onto `[0, full_scale]`.
/// Flat channels are left as they are.
fn stretch<T>(
    samples: &mut [T],
    channels: usize,
    color_channels: usize,
    full_scale: f64,
    from_f64: impl Fn(f64) -> T,
) where
    T: Copy + Into<f64>,
{
    let mut lo = [f64::INFINITY; 4];
    let mut hi = [f64::NEG_INFINITY; 4];
    for pixel in samples.chunks_exact(channels) {
        for c in 0..color_channels {
            let v: f64 = pixel[c].into();
            lo[c] = lo[c].min(v);
            hi[c] = hi[c].max(v);
        }
    }
    for pixel in samples.chunks_exact_mut(channels) {
        for c in 0..color_channels {
            let range = hi[c] - lo[c];
            if range > 0.0 {
                let v: f64 = pixel[c].into();
                pixel[c] = from_f64((v - lo[c]) * full_scale / range);
            }
        }
    }
}

/// Apply a color transform. The result is RGBA with the source alpha.
pub fn transform(raster: Raster, transform: ColorTransform) -> Raster {
    let started = Instant::now();
    let mut rgba = raster.image.to_rgba8();
    match transform {
        ColorTransform::Gray => grayscale(&mut rgba),
        ColorTransform::Bitonal => binarize(&mut rgba),
    }
    debug!(
        target: "lazy_region::color",
        transform = ?transform,
        width = rgba.width(),
        height = rgba.height(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transformed color"
    );
    Raster::new(DynamicImage::ImageRgba8(rgba))
}

fn grayscale(image: &mut RgbaImage) {
    for pixel in image.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let v = (0.21 * r as f64 + 0.71 * g as f64 + 0.07 * b as f64) as u8;
        *pixel = Rgba([v, v, v, a]);
    }
}

/// Threshold on the red channel at its Otsu level.
fn binarize(image: &mut RgbaImage) {
    let threshold = red_otsu_level(image);
    for pixel in image.pixels_mut() {
        let Rgba([r, _, _, a]) = *pixel;
        let v = if r > threshold { 255 } else { 0 };
        *pixel = Rgba([v, v, v, a]);
    }
}

pub fn red_otsu_level(image: &RgbaImage) -> u8 {
    let (w, h) = image.dimensions();
    let red = GrayImage::from_fn(w, h, |x, y| Luma([image.get_pixel(x, y)[0]]));
    otsu_level(&red)
}
