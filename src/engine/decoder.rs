// src/engine/decoder.rs
//
// Decoder backends: the capability interface the engine consumes, plus the
// in-process backends (mozjpeg, zune-png, libwebp and the image crate).

use crate::engine::common::run_with_panic_policy;
use crate::engine::io::{extract_icc_profile, ByteSource};
use crate::engine::pyramid::{halved_sizes, DecompositionLevel};
use crate::engine::raster::Raster;
use crate::engine::region::{extract_region, DecodeRegion, ReaderHints};
use crate::engine::resize;
use crate::error::LazyRegionError;
use crate::ops::{Orientation, ScaleFilter};
use image::codecs::gif::GifDecoder;
use image::{
    AnimationDecoder, DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, ImageFormat,
    ImageReader, Luma, LumaA, Rgb, RgbImage, Rgba, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use tracing::{debug, warn};
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::bytestream::ZCursor;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

use crate::engine::{MAX_DIMENSION, MAX_PIXELS};

type DecoderResult<T> = std::result::Result<T, LazyRegionError>;

/// DCT scaling supports 8/8, 4/8, 2/8 and 1/8.
const JPEG_DCT_LEVELS: u32 = 4;

/// Upper bound on synthesized in-memory pyramid depth.
const MAX_SYNTHESIZED_LEVELS: usize = 8;

// =============================================================================
// FORMATS AND RESULTS
// =============================================================================

/// Source formats recognised by magic bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
    Tiff,
    Bmp,
    Jpeg2000,
}

impl SourceFormat {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
            Self::Jpeg2000 => "jp2",
        }
    }

    /// Detect the format from magic bytes. Returns None if unknown.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        const JP2_SIGNATURE: [u8; 12] = [
            0x00, 0x00, 0x00, 0x0C, 0x6A, 0x50, 0x20, 0x20, 0x0D, 0x0A, 0x87, 0x0A,
        ];
        const J2K_CODESTREAM: [u8; 4] = [0xFF, 0x4F, 0xFF, 0x51];
        if bytes.starts_with(&JP2_SIGNATURE) || bytes.starts_with(&J2K_CODESTREAM) {
            return Some(Self::Jpeg2000);
        }
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::WebP => Some(Self::WebP),
            ImageFormat::Gif => Some(Self::Gif),
            ImageFormat::Tiff => Some(Self::Tiff),
            ImageFormat::Bmp => Some(Self::Bmp),
            _ => None,
        }
    }
}

/// A raster returned by a backend, with what the backend already did to it.
#[derive(Clone, Debug)]
pub struct DecodedRaster {
    pub raster: Raster,
    pub hints: ReaderHints,
}

impl DecodedRaster {
    pub fn new(raster: Raster) -> Self {
        Self {
            raster,
            hints: ReaderHints::empty(),
        }
    }
}

/// One frame of a multi-frame source at full resolution.
#[derive(Clone, Debug)]
pub struct SourceFrame {
    pub raster: Raster,
    pub delay_ms: u32,
}

// =============================================================================
// BACKEND INTERFACE
// =============================================================================

/// Capability interface every decoder backend implements.
///
/// Level 0 is full resolution; higher indexes are smaller. Regions passed to
/// `read_region` are in the coordinate space of the requested level and the
/// returned raster honors the region's subsample stride.
pub trait DecoderBackend: Send {
    fn source_format(&self) -> SourceFormat;

    /// Cheap level count, or None when it cannot be known without a scan.
    fn quick_level_count(&mut self) -> Option<u32>;

    /// Authoritative level count; may be expensive.
    fn scan_level_count(&mut self) -> DecoderResult<u32>;

    fn num_levels(&mut self) -> DecoderResult<u32> {
        match self.quick_level_count() {
            Some(count) => Ok(count),
            None => self.scan_level_count(),
        }
    }

    fn level_size(&mut self, level: usize) -> DecoderResult<(u32, u32)>;

    fn level_tile_size(&mut self, level: usize) -> DecoderResult<(u32, u32)> {
        self.level_size(level)
    }

    fn levels(&mut self) -> DecoderResult<Vec<DecompositionLevel>> {
        let count = self.num_levels()?.max(1) as usize;
        let mut levels = Vec::with_capacity(count);
        for index in 0..count {
            let (w, h) = self.level_size(index)?;
            let (tw, th) = self.level_tile_size(index)?;
            levels.push(DecompositionLevel::new(index, w, h).with_tile_size(tw, th));
        }
        Ok(levels)
    }

    fn read_region(&mut self, level: usize, region: &DecodeRegion) -> DecoderResult<DecodedRaster>;

    /// Rotation needed to display the stored pixels upright.
    fn orientation(&mut self) -> Orientation {
        Orientation::Rotate0
    }

    fn icc_profile(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn frame_count(&mut self) -> DecoderResult<usize> {
        Ok(1)
    }

    fn read_frame(&mut self, index: usize) -> DecoderResult<SourceFrame> {
        if index != 0 {
            return Err(LazyRegionError::invalid_argument(
                "frame",
                index.to_string(),
                "source has a single frame",
            ));
        }
        let (w, h) = self.level_size(0)?;
        let decoded = self.read_region(0, &DecodeRegion::full(w, h))?;
        Ok(SourceFrame {
            raster: decoded.raster,
            delay_ms: 0,
        })
    }

    /// Release native resources. The backend must not be used afterwards.
    fn dispose(&mut self) {}
}

// =============================================================================
// LIMITS AND METADATA
// =============================================================================

/// Check if image dimensions are within safe limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32) -> DecoderResult<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(LazyRegionError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(LazyRegionError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Read header dimensions without decoding pixel data.
pub fn read_dimensions(bytes: &[u8]) -> DecoderResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| LazyRegionError::source_decode_failed(format!("failed to read header: {e}")))?;
    reader
        .into_dimensions()
        .map_err(|e| LazyRegionError::source_decode_failed(format!("failed to read dimensions: {e}")))
}

/// Extract the EXIF Orientation. A missing tag is `Ok(None)`; unreadable
/// EXIF is a metadata failure the caller may ignore.
pub fn read_exif_orientation(bytes: &[u8]) -> DecoderResult<Option<Orientation>> {
    let mut cursor = Cursor::new(bytes);
    let exif = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        Err(exif::Error::NotFound(_)) => return Ok(None),
        Err(e) => {
            return Err(LazyRegionError::metadata_read_failed(
                "exif orientation",
                e.to_string(),
            ))
        }
    };
    let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) else {
        return Ok(None);
    };
    match field.value.get_uint(0) {
        Some(value) if (1..=8).contains(&value) => Ok(Some(Orientation::from_exif(value as u16))),
        _ => Err(LazyRegionError::metadata_read_failed(
            "exif orientation",
            format!("invalid orientation value {:?}", field.value),
        )),
    }
}

/// Orientation of `bytes`, treating unreadable metadata as upright.
fn orientation_or_default(bytes: &[u8], format: SourceFormat) -> Orientation {
    if !matches!(
        format,
        SourceFormat::Jpeg | SourceFormat::Png | SourceFormat::WebP | SourceFormat::Tiff
    ) {
        return Orientation::Rotate0;
    }
    match read_exif_orientation(bytes) {
        Ok(orientation) => orientation.unwrap_or_default(),
        Err(err) => {
            warn!(target: "lazy_region::decoder", error = %err, "continuing without orientation");
            Orientation::Rotate0
        }
    }
}

fn png_is_indexed(bytes: &[u8]) -> bool {
    // IHDR color type lives at byte 25
    bytes.len() > 25 && bytes[25] == 3
}

// =============================================================================
// CODECS
// =============================================================================

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo), scaled by
/// `scale_num / 8` in the DCT domain.
pub fn decode_jpeg_mozjpeg(data: &[u8], scale_num: u8) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(LazyRegionError::source_decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let mut decompress = Decompress::new_mem(data).map_err(|e| {
            LazyRegionError::source_decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;
        check_dimensions(decompress.width() as u32, decompress.height() as u32)?;
        decompress.scale(scale_num.clamp(1, 8));

        let mut decompress = decompress.rgb().map_err(|e| {
            LazyRegionError::source_decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = decompress.width() as u32;
        let height = decompress.height() as u32;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            LazyRegionError::source_decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image = RgbImage::from_raw(width, height, flat_pixels).ok_or_else(|| {
            LazyRegionError::source_decode_failed("mozjpeg: failed to create image from raw data")
        })?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Decode PNG using zune-png. 16-bit samples are kept; the pipeline reduces
/// them later.
pub fn decode_png_zune(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), DecoderOptions::default());
        let pixels = decoder
            .decode()
            .map_err(|e| LazyRegionError::source_decode_failed(format!("png: decode failed: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| LazyRegionError::source_decode_failed("png: missing header info"))?;
        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| LazyRegionError::source_decode_failed("png: missing colorspace"))?;

        let built = match pixels {
            zune_core::result::DecodingResult::U8(buf) => match colorspace {
                ColorSpace::RGB => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
                ColorSpace::RGBA => {
                    RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
                }
                ColorSpace::Luma => {
                    GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
                }
                ColorSpace::LumaA => {
                    GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
                }
                other => {
                    return Err(LazyRegionError::source_decode_failed(format!(
                        "png: unsupported colorspace {other:?}"
                    )))
                }
            },
            zune_core::result::DecodingResult::U16(buf) => match colorspace {
                ColorSpace::RGB => ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, buf)
                    .map(DynamicImage::ImageRgb16),
                ColorSpace::RGBA => ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, buf)
                    .map(DynamicImage::ImageRgba16),
                ColorSpace::Luma => ImageBuffer::<Luma<u16>, _>::from_raw(width, height, buf)
                    .map(DynamicImage::ImageLuma16),
                ColorSpace::LumaA => ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, buf)
                    .map(DynamicImage::ImageLumaA16),
                other => {
                    return Err(LazyRegionError::source_decode_failed(format!(
                        "png: unsupported 16-bit colorspace {other:?}"
                    )))
                }
            },
            _ => {
                return Err(LazyRegionError::source_decode_failed(
                    "png: unexpected sample type",
                ))
            }
        };

        built.ok_or_else(|| LazyRegionError::source_decode_failed("png: pixel buffer size mismatch"))
    })
}

/// Decode WebP using libwebp. Animated WebP falls back to the image crate.
pub fn decode_webp_libwebp(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        // Parse header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data).ok_or_else(|| {
            LazyRegionError::source_decode_failed("webp: failed to read bitstream features")
        })?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            return image::load_from_memory(data).map_err(|e| {
                LazyRegionError::source_decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| LazyRegionError::source_decode_failed("webp: decode failed"))?;
        Ok(decoded.to_image())
    })
}

/// Decode remaining formats with the image crate.
pub fn decode_with_image_crate(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        image::load_from_memory(data)
            .map_err(|e| LazyRegionError::source_decode_failed(format!("decode failed: {e}")))
    })
}

/// Unified decode entrypoint routing by detected format.
pub fn decode_image(bytes: &[u8], format: SourceFormat) -> DecoderResult<Raster> {
    let image = match format {
        SourceFormat::Jpeg => decode_jpeg_mozjpeg(bytes, 8)?,
        SourceFormat::Png => decode_png_zune(bytes)?,
        SourceFormat::WebP => decode_webp_libwebp(bytes)?,
        SourceFormat::Gif | SourceFormat::Tiff | SourceFormat::Bmp => {
            decode_with_image_crate(bytes)?
        }
        SourceFormat::Jpeg2000 => {
            return Err(LazyRegionError::unsupported_source_format(format.name()))
        }
    };
    let indexed = match format {
        SourceFormat::Gif => true,
        SourceFormat::Png => png_is_indexed(bytes),
        _ => false,
    };
    Ok(if indexed {
        Raster::indexed(image)
    } else {
        Raster::new(image)
    })
}

fn decode_gif_frames(bytes: &[u8]) -> DecoderResult<Vec<SourceFrame>> {
    run_with_panic_policy("decode:gif-frames", || {
        let decoder = GifDecoder::new(Cursor::new(bytes))
            .map_err(|e| LazyRegionError::source_decode_failed(format!("gif: {e}")))?;
        let frames = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| LazyRegionError::source_decode_failed(format!("gif frames: {e}")))?;
        Ok(frames
            .into_iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                SourceFrame {
                    raster: Raster::indexed(DynamicImage::ImageRgba8(frame.into_buffer())),
                    delay_ms: numer / denom.max(1),
                }
            })
            .collect())
    })
}

fn detect_supported(source: &ByteSource) -> DecoderResult<SourceFormat> {
    SourceFormat::detect(source.as_bytes())
        .ok_or_else(|| LazyRegionError::unsupported_source_format("unknown"))
}

fn level_out_of_range(level: usize, count: usize) -> LazyRegionError {
    LazyRegionError::invalid_argument(
        "level",
        level.to_string(),
        format!("source has {count} level(s)"),
    )
}

// =============================================================================
// RASTER BACKEND
// =============================================================================

/// In-process backend for single-resolution formats. Decodes the whole image
/// once; can synthesize a halved pyramid in memory so small requests resample
/// from a nearby level.
pub struct RasterBackend {
    source: ByteSource,
    format: SourceFormat,
    sizes: Vec<(u32, u32)>,
    decoded: Vec<Option<Raster>>,
    frames: Option<Vec<SourceFrame>>,
    orientation: Option<Orientation>,
}

impl RasterBackend {
    pub fn new(source: ByteSource) -> DecoderResult<Self> {
        let format = detect_supported(&source)?;
        if format == SourceFormat::Jpeg2000 {
            return Err(LazyRegionError::unsupported_source_format(format.name()));
        }
        let (width, height) = read_dimensions(source.as_bytes())?;
        check_dimensions(width, height)?;
        debug!(
            target: "lazy_region::decoder",
            format = format.name(),
            width,
            height,
            "opened raster source"
        );
        Ok(Self {
            source,
            format,
            sizes: vec![(width, height)],
            decoded: vec![None],
            frames: None,
            orientation: None,
        })
    }

    /// Expose halved levels down to `min_size` pixels on the short side.
    pub fn with_pyramid(mut self, min_size: u32) -> Self {
        let (w, h) = self.sizes[0];
        self.sizes = halved_sizes(w, h, min_size, MAX_SYNTHESIZED_LEVELS);
        self.decoded.resize(self.sizes.len(), None);
        self
    }

    fn level(&mut self, level: usize) -> DecoderResult<&Raster> {
        if level >= self.sizes.len() {
            return Err(level_out_of_range(level, self.sizes.len()));
        }
        if self.decoded[level].is_none() {
            let raster = if level == 0 {
                decode_image(self.source.as_bytes(), self.format)?
            } else {
                let parent = self.level(level - 1)?.clone();
                let (w, h) = self.sizes[level];
                let image = resize::resize(parent.image.clone(), w, h, ScaleFilter::Box, false)?;
                parent.with_image(image)
            };
            self.decoded[level] = Some(raster);
        }
        self.decoded[level]
            .as_ref()
            .ok_or_else(|| LazyRegionError::internal_panic("decoded level missing after decode"))
    }
}

impl DecoderBackend for RasterBackend {
    fn source_format(&self) -> SourceFormat {
        self.format
    }

    fn quick_level_count(&mut self) -> Option<u32> {
        Some(self.sizes.len() as u32)
    }

    fn scan_level_count(&mut self) -> DecoderResult<u32> {
        Ok(self.sizes.len() as u32)
    }

    fn level_size(&mut self, level: usize) -> DecoderResult<(u32, u32)> {
        self.sizes
            .get(level)
            .copied()
            .ok_or_else(|| level_out_of_range(level, self.sizes.len()))
    }

    fn read_region(&mut self, level: usize, region: &DecodeRegion) -> DecoderResult<DecodedRaster> {
        let raster = self.level(level)?;
        let image = extract_region(&raster.image, region);
        Ok(DecodedRaster::new(raster.with_image(image)))
    }

    fn orientation(&mut self) -> Orientation {
        let (bytes, format) = (self.source.as_bytes(), self.format);
        *self
            .orientation
            .get_or_insert_with(|| orientation_or_default(bytes, format))
    }

    fn icc_profile(&mut self) -> Option<Vec<u8>> {
        extract_icc_profile(self.source.as_bytes())
    }

    fn frame_count(&mut self) -> DecoderResult<usize> {
        if self.format != SourceFormat::Gif {
            return Ok(1);
        }
        if self.frames.is_none() {
            self.frames = Some(decode_gif_frames(self.source.as_bytes())?);
        }
        Ok(self.frames.as_ref().map_or(1, |frames| frames.len().max(1)))
    }

    fn read_frame(&mut self, index: usize) -> DecoderResult<SourceFrame> {
        if self.frame_count()? <= 1 {
            let raster = self.level(0)?.clone();
            return match index {
                0 => Ok(SourceFrame {
                    raster,
                    delay_ms: 0,
                }),
                _ => Err(LazyRegionError::invalid_argument(
                    "frame",
                    index.to_string(),
                    "source has a single frame",
                )),
            };
        }
        let frames = self.frames.as_ref().map(Vec::as_slice).unwrap_or_default();
        frames.get(index).cloned().ok_or_else(|| {
            LazyRegionError::invalid_argument(
                "frame",
                index.to_string(),
                format!("source has {} frames", frames.len()),
            )
        })
    }

    fn dispose(&mut self) {
        self.decoded.iter_mut().for_each(|level| *level = None);
        self.frames = None;
    }
}

// =============================================================================
// JPEG BACKEND
// =============================================================================

/// Block-aligned JPEG backend. The DCT can decode at 1/1, 1/2, 1/4 and 1/8
/// scale for little more than the cost of entropy decoding, so each scale is
/// exposed as a level of `ceil(w / 2^k)` x `ceil(h / 2^k)`.
pub struct JpegBackend {
    source: ByteSource,
    sizes: Vec<(u32, u32)>,
    orientation: Option<Orientation>,
}

impl JpegBackend {
    pub fn new(source: ByteSource) -> DecoderResult<Self> {
        let format = detect_supported(&source)?;
        if format != SourceFormat::Jpeg {
            return Err(LazyRegionError::unsupported_source_format(format.name()));
        }
        let (width, height) = run_with_panic_policy("decode:mozjpeg-header", || {
            let decompress = Decompress::new_mem(source.as_bytes()).map_err(|e| {
                LazyRegionError::source_decode_failed(format!("mozjpeg header failed: {e:?}"))
            })?;
            Ok((decompress.width() as u32, decompress.height() as u32))
        })?;
        check_dimensions(width, height)?;

        let sizes = (0..JPEG_DCT_LEVELS)
            .map(|k| (width.div_ceil(1 << k), height.div_ceil(1 << k)))
            .collect();
        Ok(Self {
            source,
            sizes,
            orientation: None,
        })
    }
}

impl DecoderBackend for JpegBackend {
    fn source_format(&self) -> SourceFormat {
        SourceFormat::Jpeg
    }

    fn quick_level_count(&mut self) -> Option<u32> {
        Some(self.sizes.len() as u32)
    }

    fn scan_level_count(&mut self) -> DecoderResult<u32> {
        Ok(self.sizes.len() as u32)
    }

    fn level_size(&mut self, level: usize) -> DecoderResult<(u32, u32)> {
        self.sizes
            .get(level)
            .copied()
            .ok_or_else(|| level_out_of_range(level, self.sizes.len()))
    }

    fn level_tile_size(&mut self, level: usize) -> DecoderResult<(u32, u32)> {
        // One MCU row of 8x8 blocks, reduced with the level
        let (w, _) = self.level_size(level)?;
        Ok((w, (8u32 >> level).max(1)))
    }

    fn read_region(&mut self, level: usize, region: &DecodeRegion) -> DecoderResult<DecodedRaster> {
        let (expected_w, expected_h) = self.level_size(level)?;
        let scale_num = 8u8 >> level;
        let image = decode_jpeg_mozjpeg(self.source.as_bytes(), scale_num)?;
        if (image.width(), image.height()) != (expected_w, expected_h) {
            debug!(
                target: "lazy_region::decoder",
                level,
                width = image.width(),
                height = image.height(),
                expected_w,
                expected_h,
                "DCT-scaled size differs from level size"
            );
        }
        Ok(DecodedRaster::new(Raster::new(extract_region(&image, region))))
    }

    fn orientation(&mut self) -> Orientation {
        let bytes = self.source.as_bytes();
        *self
            .orientation
            .get_or_insert_with(|| orientation_or_default(bytes, SourceFormat::Jpeg))
    }

    fn icc_profile(&mut self) -> Option<Vec<u8>> {
        extract_icc_profile(self.source.as_bytes())
    }
}
