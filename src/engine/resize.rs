// src/engine/resize.rs
//
// SIMD resampling through fast_image_resize, with optional linear-light
// processing and an image-crate fallback when fir rejects a buffer.

use crate::error::LazyRegionError;
use crate::ops::ScaleFilter;
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};

#[derive(Debug)]
pub struct ResizeError {
    pub source_dims: (u32, u32),
    pub target_dims: (u32, u32),
    pub reason: String,
}

impl ResizeError {
    pub fn new(
        source_dims: (u32, u32),
        target_dims: (u32, u32),
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source_dims,
            target_dims,
            reason: reason.into(),
        }
    }

    pub fn into_lazy_region_error(self) -> LazyRegionError {
        LazyRegionError::resize_failed(self.source_dims, self.target_dims, self.reason)
    }
}

impl From<ResizeError> for LazyRegionError {
    fn from(err: ResizeError) -> Self {
        err.into_lazy_region_error()
    }
}

fn resize_alg(filter: ScaleFilter) -> fir::ResizeAlg {
    match filter {
        ScaleFilter::Nearest => fir::ResizeAlg::Nearest,
        ScaleFilter::Box => fir::ResizeAlg::Convolution(fir::FilterType::Box),
        ScaleFilter::Triangle => fir::ResizeAlg::Convolution(fir::FilterType::Bilinear),
        ScaleFilter::Bicubic => fir::ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        ScaleFilter::Mitchell => fir::ResizeAlg::Convolution(fir::FilterType::Mitchell),
        ScaleFilter::Lanczos3 => fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3),
        ScaleFilter::Gaussian => fir::ResizeAlg::Convolution(fir::FilterType::Gaussian),
        ScaleFilter::Hamming => fir::ResizeAlg::Convolution(fir::FilterType::Hamming),
    }
}

fn fallback_filter(filter: ScaleFilter) -> FilterType {
    match filter {
        ScaleFilter::Nearest => FilterType::Nearest,
        ScaleFilter::Box | ScaleFilter::Triangle | ScaleFilter::Hamming => FilterType::Triangle,
        ScaleFilter::Bicubic | ScaleFilter::Mitchell => FilterType::CatmullRom,
        ScaleFilter::Gaussian => FilterType::Gaussian,
        ScaleFilter::Lanczos3 => FilterType::Lanczos3,
    }
}

/// Resize an owned image. RGB/RGBA buffers are handed to fir without a copy;
/// other layouts keep their channel count where fir supports it.
///
/// With `linear` set, color samples are mapped from sRGB to 16-bit linear
/// light before resampling and back afterwards.
pub fn resize(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
    filter: ScaleFilter,
    linear: bool,
) -> std::result::Result<DynamicImage, ResizeError> {
    let src_width = img.width();
    let src_height = img.height();
    let dims = ((src_width, src_height), (dst_width, dst_height));

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(ResizeError::new(dims.0, dims.1, "invalid dimensions for resize"));
    }

    let (pixel_type, mut src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageLuma8(gray) => (PixelType::U8, gray.into_raw()),
        DynamicImage::ImageLumaA8(gray) => (PixelType::U8x2, gray.into_raw()),
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other => (PixelType::U8x4, other.to_rgba8().into_raw()),
    };

    let options = ResizeOptions::new().resize_alg(resize_alg(filter));
    let linear = linear && matches!(pixel_type, PixelType::U8x3 | PixelType::U8x4);

    let required_bytes = (src_width as usize)
        .checked_mul(src_height as usize)
        .and_then(|n| n.checked_mul(pixel_type.size()))
        .ok_or_else(|| ResizeError::new(dims.0, dims.1, "image buffer size overflow"))?;

    let primary = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => resize_image(src_image, pixel_type, dst_width, dst_height, &options, linear),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let mut aligned = fir::images::Image::new(src_width, src_height, pixel_type);
            aligned
                .buffer_mut()
                .copy_from_slice(&src_pixels[..required_bytes]);
            resize_image(aligned, pixel_type, dst_width, dst_height, &options, linear)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary {
        Ok(img) => Ok(img),
        Err(err) => fallback_resize(&src_pixels, dims.0, pixel_type, dims.1, filter)
            .map_err(|fallback| {
                ResizeError::new(
                    dims.0,
                    dims.1,
                    format!("{err}; image crate fallback failed: {fallback}"),
                )
            }),
    }
}

fn has_alpha(pixel_type: PixelType) -> bool {
    matches!(
        pixel_type,
        PixelType::U8x2 | PixelType::U8x4 | PixelType::U16x4
    )
}

fn resize_image(
    src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
    linear: bool,
) -> std::result::Result<DynamicImage, String> {
    let dst_pixels = if linear {
        let wide = match pixel_type {
            PixelType::U8x3 => PixelType::U16x3,
            _ => PixelType::U16x4,
        };
        let mapper = fir::create_srgb_mapper();
        let mut linear_src =
            fir::images::Image::new(src_image.width(), src_image.height(), wide);
        mapper
            .forward_map(&src_image, &mut linear_src)
            .map_err(|e| format!("sRGB to linear mapping failed: {e:?}"))?;
        let linear_dst = resample(linear_src, wide, dst_width, dst_height, options)?;
        let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);
        mapper
            .backward_map(&linear_dst, &mut dst_image)
            .map_err(|e| format!("linear to sRGB mapping failed: {e:?}"))?;
        dst_image.into_vec()
    } else {
        resample(src_image, pixel_type, dst_width, dst_height, options)?.into_vec()
    };

    build_image(dst_pixels, pixel_type, dst_width, dst_height)
}

fn resample(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    options: &ResizeOptions,
) -> std::result::Result<fir::images::Image<'static>, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);
    let premultiply = has_alpha(pixel_type);

    let mul_div = MulDiv::default();
    if premultiply {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    let mut resizer = fir::Resizer::new();
    resizer
        .resize(&src_image, &mut dst_image, options)
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if premultiply {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }
    Ok(dst_image)
}

fn build_image(
    pixels: Vec<u8>,
    pixel_type: PixelType,
    width: u32,
    height: u32,
) -> std::result::Result<DynamicImage, String> {
    let built = match pixel_type {
        PixelType::U8 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        PixelType::U8x2 => {
            GrayAlphaImage::from_raw(width, height, pixels).map(DynamicImage::ImageLumaA8)
        }
        PixelType::U8x3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        PixelType::U8x4 => {
            RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8)
        }
        other => return Err(format!("unsupported pixel type after resize: {other:?}")),
    };
    built.ok_or_else(|| "failed to build image from resized data".to_string())
}

fn fallback_resize(
    src_pixels: &[u8],
    (src_width, src_height): (u32, u32),
    pixel_type: PixelType,
    (dst_width, dst_height): (u32, u32),
    filter: ScaleFilter,
) -> std::result::Result<DynamicImage, String> {
    let filter = fallback_filter(filter);
    let img = build_image(src_pixels.to_vec(), pixel_type, src_width, src_height)?;
    Ok(img.resize_exact(dst_width, dst_height, filter))
}
