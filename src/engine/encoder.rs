// src/engine/encoder.rs
//
// Output encoders: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp),
// GIF and TIFF (image crate). ICC profiles are embedded with img-parts.

use crate::engine::color;
use crate::engine::common::run_with_panic_policy;
use crate::engine::config::ProcessorConfig;
use crate::engine::raster::Raster;
use crate::error::LazyRegionError;
use crate::ops::{Color, EncodeOptions, OutputFormat};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, ImageFormat, Rgb, RgbImage};
use img_parts::{jpeg::Jpeg, png::Png, ImageICC};
use mozjpeg::{ColorSpace, Compress};
use std::borrow::Cow;
use std::io::{Cursor, Write};
use std::time::Instant;
use tracing::debug;

type EncoderResult<T> = std::result::Result<T, LazyRegionError>;

/// oxipng preset used when no compression scheme is named.
const PNG_DEFAULT_PRESET: u8 = 2;
const PNG_MAX_PRESET: u8 = 6;

/// One frame of an animation handed to the encoder.
#[derive(Clone, Debug)]
pub struct EncodedFrame {
    pub raster: Raster,
    pub delay_ms: u32,
}

/// Serializes rasters into an output sink.
pub trait Encoder: Send + Sync {
    fn supports(&self, format: OutputFormat) -> bool;

    fn write(
        &self,
        raster: &Raster,
        options: &EncodeOptions,
        sink: &mut dyn Write,
    ) -> EncoderResult<()>;

    /// Write an animation. Only formats that can carry frames override this.
    fn write_animation(
        &self,
        _frames: &[EncodedFrame],
        options: &EncodeOptions,
        _sink: &mut dyn Write,
    ) -> EncoderResult<()> {
        Err(LazyRegionError::unsupported_output_format(format!(
            "{} (animated)",
            options.format.name()
        )))
    }
}

/// PNG recompression choice derived from the compression scheme name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PngCompression {
    Fast,
    Optimized(u8),
}

impl PngCompression {
    fn from_name(name: Option<&str>) -> EncoderResult<Self> {
        match name.map(|n| n.to_ascii_lowercase()) {
            None => Ok(Self::Optimized(PNG_DEFAULT_PRESET)),
            Some(n) => match n.as_str() {
                "deflate" => Ok(Self::Optimized(PNG_DEFAULT_PRESET)),
                "deflate-max" => Ok(Self::Optimized(PNG_MAX_PRESET)),
                "none" | "fast" => Ok(Self::Fast),
                _ => Err(LazyRegionError::invalid_argument(
                    "compression",
                    n,
                    "png supports deflate, deflate-max, fast",
                )),
            },
        }
    }
}

/// Encoder backed by the crate's codec stack.
#[derive(Clone, Debug)]
pub struct ImageEncoder {
    background: Color,
    progressive: bool,
}

impl Default for ImageEncoder {
    fn default() -> Self {
        Self {
            background: Color::WHITE,
            progressive: false,
        }
    }
}

impl ImageEncoder {
    pub fn new(background: Color, progressive: bool) -> Self {
        Self {
            background,
            progressive,
        }
    }

    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(config.background, config.jpeg_progressive)
    }

    /// Encode into a byte vector.
    pub fn encode(&self, raster: &Raster, options: &EncodeOptions) -> EncoderResult<Vec<u8>> {
        let started = Instant::now();
        let prepared = self.prepare(raster, options);
        let icc = options.icc_profile.as_ref().map(|p| p.data.as_slice());
        let encoded = match options.format {
            OutputFormat::Jpeg => {
                let progressive = options.interlace || self.progressive;
                let data = encode_jpeg(&prepared.image, options.quality, progressive)?;
                match icc {
                    Some(profile) => embed_icc_jpeg(data, profile)?,
                    None => data,
                }
            }
            OutputFormat::Png => {
                let compression = PngCompression::from_name(options.compression.as_deref())?;
                let data = encode_png(&prepared.image, compression)?;
                match icc {
                    Some(profile) => embed_icc_png(data, profile)?,
                    None => data,
                }
            }
            OutputFormat::WebP => {
                let data = encode_webp(&prepared.image, options.quality)?;
                match icc {
                    Some(profile) => embed_icc_webp(data, profile)?,
                    None => data,
                }
            }
            OutputFormat::Gif => encode_with_image_crate(&prepared.image, ImageFormat::Gif)?,
            OutputFormat::Tiff => encode_with_image_crate(&prepared.image, ImageFormat::Tiff)?,
        };
        debug!(
            target: "lazy_region::encoder",
            format = options.format.name(),
            width = prepared.width(),
            height = prepared.height(),
            bytes = encoded.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "encoded raster"
        );
        Ok(encoded)
    }

    /// Flatten alpha for formats that cannot carry it and apply the
    /// output sample-size cap.
    fn prepare<'r>(&self, raster: &'r Raster, options: &EncodeOptions) -> Cow<'r, Raster> {
        let mut prepared = Cow::Borrowed(raster);
        if options.max_sample_size == Some(8) && prepared.sample_depth() > 8 {
            prepared = Cow::Owned(color::reduce_to_8_bits(prepared.into_owned()));
        }
        if !options.format.supports_alpha() && prepared.has_alpha() {
            let background = options.background.unwrap_or(self.background);
            let flat = flatten(&prepared.image, background);
            prepared = Cow::Owned(prepared.with_image(flat));
        }
        prepared
    }
}

impl Encoder for ImageEncoder {
    fn supports(&self, format: OutputFormat) -> bool {
        matches!(
            format,
            OutputFormat::Jpeg
                | OutputFormat::Png
                | OutputFormat::WebP
                | OutputFormat::Gif
                | OutputFormat::Tiff
        )
    }

    fn write(
        &self,
        raster: &Raster,
        options: &EncodeOptions,
        sink: &mut dyn Write,
    ) -> EncoderResult<()> {
        let encoded = self.encode(raster, options)?;
        sink.write_all(&encoded)
            .map_err(|e| LazyRegionError::file_write_failed("output sink", e))
    }

    fn write_animation(
        &self,
        frames: &[EncodedFrame],
        options: &EncodeOptions,
        sink: &mut dyn Write,
    ) -> EncoderResult<()> {
        if options.format != OutputFormat::Gif {
            return Err(LazyRegionError::unsupported_output_format(format!(
                "{} (animated)",
                options.format.name()
            )));
        }
        let encoded = encode_gif_animation(frames)?;
        debug!(
            target: "lazy_region::encoder",
            frames = frames.len(),
            bytes = encoded.len(),
            "encoded animation"
        );
        sink.write_all(&encoded)
            .map_err(|e| LazyRegionError::file_write_failed("output sink", e))
    }
}

/// Composite over an opaque background, dropping alpha.
pub fn flatten(image: &DynamicImage, background: Color) -> DynamicImage {
    let rgba = image.to_rgba8();
    let (w, h) = rgba.dimensions();
    let bg = [background.r as u32, background.g as u32, background.b as u32];
    let flat = RgbImage::from_fn(w, h, |x, y| {
        let p = rgba.get_pixel(x, y).0;
        let a = p[3] as u32;
        let mix = |c: usize| ((p[c] as u32 * a + bg[c] * (255 - a) + 127) / 255) as u8;
        Rgb([mix(0), mix(1), mix(2)])
    });
    DynamicImage::ImageRgb8(flat)
}

fn encode_jpeg(img: &DynamicImage, quality: u8, progressive: bool) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let rgb: Cow<'_, RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        if w == 0 || h == 0 {
            return Err(LazyRegionError::encode_failed("jpeg", "empty raster"));
        }

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(quality.min(100) as f32);
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_optimize_coding(true);
        if progressive {
            comp.set_progressive_mode();
        }

        let mut output = Vec::with_capacity((w as usize * h as usize / 4).max(4096));
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                LazyRegionError::encode_failed("jpeg", format!("mozjpeg: start failed: {e:?}"))
            })?;
            for row in rgb.as_raw().chunks(w as usize * 3) {
                writer.write_scanlines(row).map_err(|e| {
                    LazyRegionError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: scanline write failed: {e:?}"),
                    )
                })?;
            }
            writer.finish().map_err(|e| {
                LazyRegionError::encode_failed("jpeg", format!("mozjpeg: finish failed: {e:?}"))
            })?;
        }
        Ok(output)
    })
}

fn encode_png(img: &DynamicImage, compression: PngCompression) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| LazyRegionError::encode_failed("png", e.to_string()))?;

        let PngCompression::Optimized(preset) = compression else {
            return Ok(buf);
        };
        let mut options = oxipng::Options::from_preset(preset);
        options.strip = oxipng::StripChunks::None;
        oxipng::optimize_from_memory(&buf, &options)
            .map_err(|e| LazyRegionError::encode_failed("png", format!("oxipng: {e}")))
    })
}

fn encode_webp(img: &DynamicImage, quality: u8) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let (w, h) = (img.width(), img.height());
        let rgba;
        let rgb;
        let encoder = if img.color().has_alpha() {
            rgba = img.to_rgba8();
            webp::Encoder::from_rgba(&rgba, w, h)
        } else {
            rgb = img.to_rgb8();
            webp::Encoder::from_rgb(&rgb, w, h)
        };

        let mut config = webp::WebPConfig::new()
            .map_err(|_| LazyRegionError::internal_panic("failed to create WebPConfig"))?;
        config.quality = quality.min(100) as f32;
        config.method = 4;
        config.autofilter = 1;

        let mem = encoder
            .encode_advanced(&config)
            .map_err(|e| LazyRegionError::encode_failed("webp", format!("{e:?}")))?;
        Ok(mem.to_vec())
    })
}

fn encode_with_image_crate(img: &DynamicImage, format: ImageFormat) -> EncoderResult<Vec<u8>> {
    let name = if format == ImageFormat::Gif { "gif" } else { "tiff" };
    // GIF carries 8-bit RGBA only.
    let converted;
    let img = if format == ImageFormat::Gif && !matches!(img, DynamicImage::ImageRgba8(_)) {
        converted = DynamicImage::ImageRgba8(img.to_rgba8());
        &converted
    } else {
        img
    };
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format)
        .map_err(|e| LazyRegionError::encode_failed(name, e.to_string()))?;
    Ok(buf)
}

fn encode_gif_animation(frames: &[EncodedFrame]) -> EncoderResult<Vec<u8>> {
    if frames.is_empty() {
        return Err(LazyRegionError::encode_failed("gif", "animation has no frames"));
    }
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|e| LazyRegionError::encode_failed("gif", e.to_string()))?;
        let frames = frames.iter().map(|f| {
            Frame::from_parts(
                f.raster.image.to_rgba8(),
                0,
                0,
                Delay::from_numer_denom_ms(f.delay_ms, 1),
            )
        });
        encoder
            .encode_frames(frames)
            .map_err(|e| LazyRegionError::encode_failed("gif", e.to_string()))?;
    }
    Ok(buf)
}

/// Embed an ICC profile into JPEG data as a single APP2 segment.
pub fn embed_icc_jpeg(jpeg_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg:embed_icc", || {
        use img_parts::jpeg::{markers::APP2, JpegSegment};
        use img_parts::Bytes;

        let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data))
            .map_err(|e| LazyRegionError::encode_failed("jpeg", format!("reparse for ICC: {e}")))?;

        let mut marker = Vec::with_capacity(14 + icc.len());
        marker.extend_from_slice(b"ICC_PROFILE\0");
        marker.push(1);
        marker.push(1);
        marker.extend_from_slice(icc);
        jpeg.segments_mut()
            .insert(0, JpegSegment::new_with_contents(APP2, Bytes::from(marker)));

        let mut output = Vec::new();
        jpeg.encoder()
            .write_to(&mut output)
            .map_err(|e| LazyRegionError::encode_failed("jpeg", format!("write with ICC: {e}")))?;
        Ok(output)
    })
}

pub fn embed_icc_png(png_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:png:embed_icc", || {
        use img_parts::Bytes;

        let mut png = Png::from_bytes(Bytes::from(png_data))
            .map_err(|e| LazyRegionError::encode_failed("png", format!("reparse for ICC: {e}")))?;
        png.set_icc_profile(Some(Bytes::from(icc.to_vec())));

        let mut output = Vec::new();
        png.encoder()
            .write_to(&mut output)
            .map_err(|e| LazyRegionError::encode_failed("png", format!("write with ICC: {e}")))?;
        Ok(output)
    })
}

pub fn embed_icc_webp(webp_data: Vec<u8>, icc: &[u8]) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:webp:embed_icc", || {
        use img_parts::webp::WebP;
        use img_parts::Bytes;

        let mut webp = WebP::from_bytes(Bytes::from(webp_data))
            .map_err(|e| LazyRegionError::encode_failed("webp", format!("reparse for ICC: {e}")))?;
        webp.set_icc_profile(Some(Bytes::from(icc.to_vec())));

        let mut output = Vec::new();
        webp.encoder()
            .write_to(&mut output)
            .map_err(|e| LazyRegionError::encode_failed("webp", format!("write with ICC: {e}")))?;
        Ok(output)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::io::extract_icc_profile;
    use crate::ops::IccProfile;
    use image::{ImageBuffer, Rgba, RgbaImage};
    use std::sync::Arc;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 90])
        }))
    }

    fn encode(raster: &Raster, options: &EncodeOptions) -> Vec<u8> {
        let mut sink = Vec::new();
        ImageEncoder::default()
            .write(raster, options, &mut sink)
            .unwrap();
        sink
    }

    fn fake_icc() -> IccProfile {
        let mut data = vec![0u8; 128];
        data[..4].copy_from_slice(&128u32.to_be_bytes());
        data[4..8].copy_from_slice(b"lcms");
        data[8] = 4;
        data[12..16].copy_from_slice(b"mntr");
        data[16..20].copy_from_slice(b"RGB ");
        data[20..24].copy_from_slice(b"XYZ ");
        IccProfile {
            name: "test".to_string(),
            data: Arc::new(data),
        }
    }

    mod format_tests {
        use super::*;

        #[test]
        fn test_every_format_round_trips_dimensions() {
            let raster = Raster::new(create_test_image(40, 24));
            for format in [
                OutputFormat::Jpeg,
                OutputFormat::Png,
                OutputFormat::WebP,
                OutputFormat::Gif,
                OutputFormat::Tiff,
            ] {
                let bytes = encode(&raster, &EncodeOptions::new(format));
                let decoded = image::load_from_memory(&bytes).unwrap();
                assert_eq!((decoded.width(), decoded.height()), (40, 24), "{format:?}");
            }
        }

        #[test]
        fn test_jpeg_magic_and_progressive() {
            let raster = Raster::new(create_test_image(32, 32));
            let mut options = EncodeOptions::new(OutputFormat::Jpeg);
            let baseline = encode(&raster, &options);
            options.interlace = true;
            let progressive = encode(&raster, &options);
            assert_eq!(&baseline[..2], &[0xFF, 0xD8]);
            // SOF2 marks a progressive frame.
            assert!(progressive.windows(2).any(|w| w == [0xFF, 0xC2]));
            assert!(!baseline.windows(2).any(|w| w == [0xFF, 0xC2]));
        }

        #[test]
        fn test_png_compression_names() {
            assert_eq!(
                PngCompression::from_name(Some("Deflate-Max")).unwrap(),
                PngCompression::Optimized(PNG_MAX_PRESET)
            );
            assert_eq!(PngCompression::from_name(Some("none")).unwrap(), PngCompression::Fast);
            assert!(PngCompression::from_name(Some("lzw")).is_err());
        }

        #[test]
        fn test_png_keeps_alpha() {
            let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 40]));
            let bytes = encode(
                &Raster::new(DynamicImage::ImageRgba8(img)),
                &EncodeOptions::new(OutputFormat::Png),
            );
            let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
            assert_eq!(decoded.get_pixel(0, 0).0, [10, 20, 30, 40]);
        }

        #[test]
        fn test_animation_rejected_for_still_formats() {
            let frames = vec![EncodedFrame {
                raster: Raster::new(create_test_image(4, 4)),
                delay_ms: 10,
            }];
            let err = ImageEncoder::default()
                .write_animation(&frames, &EncodeOptions::new(OutputFormat::Png), &mut Vec::new())
                .unwrap_err();
            assert!(matches!(err, LazyRegionError::UnsupportedOutputFormat { .. }));
        }

        #[test]
        fn test_gif_animation_frames() {
            let frames: Vec<EncodedFrame> = (0..3)
                .map(|i| EncodedFrame {
                    raster: Raster::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
                        6,
                        6,
                        Rgba([i * 80, 0, 0, 255]),
                    ))),
                    delay_ms: 40,
                })
                .collect();
            let mut sink = Vec::new();
            ImageEncoder::default()
                .write_animation(&frames, &EncodeOptions::new(OutputFormat::Gif), &mut sink)
                .unwrap();
            use image::AnimationDecoder;
            let decoder = image::codecs::gif::GifDecoder::new(Cursor::new(sink)).unwrap();
            assert_eq!(decoder.into_frames().count(), 3);
        }
    }

    mod flatten_tests {
        use super::*;

        #[test]
        fn test_flatten_over_background() {
            let img = RgbaImage::from_fn(2, 1, |x, _| {
                if x == 0 {
                    Rgba([0, 0, 0, 0])
                } else {
                    Rgba([0, 0, 0, 255])
                }
            });
            let flat = flatten(&DynamicImage::ImageRgba8(img), Color::rgba(200, 100, 50, 255));
            let rgb = flat.to_rgb8();
            assert_eq!(rgb.get_pixel(0, 0).0, [200, 100, 50]);
            assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 0]);
        }

        #[test]
        fn test_jpeg_uses_option_background() {
            let img = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]));
            let mut options = EncodeOptions::new(OutputFormat::Jpeg).with_quality(95);
            options.background = Some(Color::rgba(255, 0, 0, 255));
            let bytes = encode(&Raster::new(DynamicImage::ImageRgba8(img)), &options);
            let px = image::load_from_memory(&bytes).unwrap().to_rgb8().get_pixel(8, 8).0;
            assert!(px[0] > 230 && px[1] < 30 && px[2] < 30, "{px:?}");
        }

        #[test]
        fn test_sample_size_cap() {
            let img: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::from_pixel(2, 2, Rgb([65535, 0, 0]));
            let raster = Raster::new(DynamicImage::ImageRgb16(img));
            let mut options = EncodeOptions::new(OutputFormat::Png);
            options.max_sample_size = Some(8);
            let prepared = ImageEncoder::default().prepare(&raster, &options);
            assert_eq!(prepared.sample_depth(), 8);
        }
    }

    mod icc_tests {
        use super::*;

        #[test]
        fn test_icc_embedded_in_containers() {
            let raster = Raster::new(create_test_image(8, 8));
            let profile = fake_icc();
            for format in [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::WebP] {
                let mut options = EncodeOptions::new(format);
                options.icc_profile = Some(profile.clone());
                let bytes = encode(&raster, &options);
                let extracted = extract_icc_profile(&bytes);
                assert_eq!(extracted.as_deref(), Some(profile.data.as_slice()), "{format:?}");
            }
        }
    }
}
