// src/engine/raster.rs
//
// Owned pixel buffer passed between pipeline stages.

use image::{ColorType, DynamicImage, RgbaImage};

/// Decoded pixels plus the facts about them the pipeline needs.
///
/// Each stage takes the raster by value and returns a new one; there is no
/// shared mutable aliasing between stages.
#[derive(Clone, Debug)]
pub struct Raster {
    pub image: DynamicImage,
    /// Source pixels were palette-indexed before expansion
    pub indexed: bool,
}

impl Raster {
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image,
            indexed: false,
        }
    }

    pub fn indexed(image: DynamicImage) -> Self {
        Self {
            image,
            indexed: true,
        }
    }

    /// Fully transparent RGBA raster.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(DynamicImage::ImageRgba8(RgbaImage::new(
            width.max(1),
            height.max(1),
        )))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    /// Bits per sample.
    pub fn sample_depth(&self) -> u8 {
        let color = self.image.color();
        (color.bytes_per_pixel() / color.channel_count()) * 8
    }

    pub fn has_alpha(&self) -> bool {
        self.image.color().has_alpha()
    }

    pub fn color_type(&self) -> ColorType {
        self.image.color()
    }

    /// Same flags, new pixels.
    pub fn with_image(&self, image: DynamicImage) -> Self {
        Self {
            image,
            indexed: self.indexed,
        }
    }

    pub fn into_image(self) -> DynamicImage {
        self.image
    }
}

impl From<DynamicImage> for Raster {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_blank_is_transparent_rgba() {
        let raster = Raster::blank(2, 1);
        assert_eq!(raster.dimensions(), (2, 1));
        assert_eq!(raster.channels(), 4);
        assert_eq!(raster.image.to_rgba8().get_pixel(1, 0).0, [0, 0, 0, 0]);
    }

    #[test]
    fn test_sample_depth() {
        let rgb8 = Raster::new(DynamicImage::new_rgb8(1, 1));
        assert_eq!(rgb8.sample_depth(), 8);
        let rgb16: ImageBuffer<Rgb<u16>, Vec<u16>> = ImageBuffer::new(1, 1);
        let rgb16 = Raster::new(DynamicImage::ImageRgb16(rgb16));
        assert_eq!(rgb16.sample_depth(), 16);
        assert_eq!(rgb16.channels(), 3);
    }
}
