// src/ops.rs
//
// Logical operations and the operation list handed to the engine.
// These are cheap to create and store - the expensive work happens in the engine.
//
// Coordinates carried by operations refer to the full-resolution image as it
// is meant to be displayed (after EXIF orientation). The engine rebases them
// into decoded-level and stored-orientation space itself.

use crate::engine::ReductionFactor;
use crate::error::LazyRegionError;
use std::sync::Arc;

/// Tolerance used by every `has_effect` comparison.
pub const DELTA: f64 = 0.00001;

type OpsResult<T> = std::result::Result<T, LazyRegionError>;

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Dimension {
    pub width: f64,
    pub height: f64,
}

impl Dimension {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn from_u32(width: u32, height: u32) -> Self {
        Self::new(width as f64, height as f64)
    }

    pub fn int_width(&self) -> u32 {
        self.width.round().max(0.0) as u32
    }

    pub fn int_height(&self) -> u32 {
        self.height.round().max(0.0) as u32
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }

    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= DELTA || self.height <= DELTA
    }
}

/// Axis-aligned rectangle with fractional coordinates. Rounded accessors
/// follow round-half-up, matching how regions are handed to backends.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn from_u32(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self::new(x as f64, y as f64, width as f64, height as f64)
    }

    /// Rectangle covering a whole image of the given size.
    pub fn full(size: Dimension) -> Self {
        Self::new(0.0, 0.0, size.width, size.height)
    }

    pub fn size(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width <= DELTA || self.height <= DELTA
    }

    /// Overlapping area of both rectangles, or an empty rectangle at the
    /// origin when they do not overlap.
    pub fn intersection(&self, other: &Rect) -> Rect {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right - x <= DELTA || bottom - y <= DELTA {
            return Rect::default();
        }
        Rect::new(x, y, right - x, bottom - y)
    }

    pub fn clipped_to(&self, size: Dimension) -> Rect {
        self.intersection(&Rect::full(size))
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Rect {
        Rect::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    pub fn scaled(&self, factor: f64) -> Rect {
        Rect::new(
            self.x * factor,
            self.y * factor,
            self.width * factor,
            self.height * factor,
        )
    }

    pub fn int_x(&self) -> u32 {
        self.x.round().max(0.0) as u32
    }

    pub fn int_y(&self) -> u32 {
        self.y.round().max(0.0) as u32
    }

    pub fn int_width(&self) -> u32 {
        self.width.round().max(0.0) as u32
    }

    pub fn int_height(&self) -> u32 {
        self.height.round().max(0.0) as u32
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{} {}x{}",
            self.int_x(),
            self.int_y(),
            self.int_width(),
            self.int_height()
        )
    }
}

// =============================================================================
// ORIENTATION
// =============================================================================

/// Clockwise rotation needed to display the stored pixels upright.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    /// Map an EXIF Orientation tag (1-8). Mirrored variants map to the rotation
    /// they include; unknown values mean no rotation.
    pub fn from_exif(value: u16) -> Self {
        match value {
            3 | 4 => Orientation::Rotate180,
            5 | 6 => Orientation::Rotate90,
            7 | 8 => Orientation::Rotate270,
            _ => Orientation::Rotate0,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Orientation::Rotate0 => 0,
            Orientation::Rotate90 => 90,
            Orientation::Rotate180 => 180,
            Orientation::Rotate270 => 270,
        }
    }

    pub fn swaps_axes(&self) -> bool {
        matches!(self, Orientation::Rotate90 | Orientation::Rotate270)
    }

    /// Displayed size of a stored image.
    pub fn oriented_size(&self, stored: Dimension) -> Dimension {
        if self.swaps_axes() {
            stored.swapped()
        } else {
            stored
        }
    }

    /// Map a rectangle given in display space back onto the stored pixels.
    pub fn unrotate_rect(&self, rect: Rect, stored: Dimension) -> Rect {
        match self {
            Orientation::Rotate0 => rect,
            Orientation::Rotate90 => Rect::new(
                rect.y,
                stored.height - rect.x - rect.width,
                rect.height,
                rect.width,
            ),
            Orientation::Rotate180 => Rect::new(
                stored.width - rect.x - rect.width,
                stored.height - rect.y - rect.height,
                rect.width,
                rect.height,
            ),
            Orientation::Rotate270 => Rect::new(
                stored.width - rect.y - rect.height,
                rect.x,
                rect.height,
                rect.width,
            ),
        }
    }
}

// =============================================================================
// CROP
// =============================================================================

/// Region of the source to keep.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Crop {
    /// Whole image
    #[default]
    Full,
    /// Pixel rectangle in full-resolution coordinates
    Pixels {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// Fractions (0-1) of the full image
    Percent {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    /// Largest centered square
    Square,
}

impl Crop {
    pub fn pixels(x: u32, y: u32, width: u32, height: u32) -> Self {
        Crop::Pixels {
            x,
            y,
            width,
            height,
        }
    }

    pub fn percent(x: f64, y: f64, width: f64, height: f64) -> Self {
        Crop::Percent {
            x,
            y,
            width,
            height,
        }
    }

    pub fn validate(&self) -> OpsResult<()> {
        match self {
            Crop::Full | Crop::Square => Ok(()),
            Crop::Pixels { width, height, .. } => {
                if *width == 0 || *height == 0 {
                    return Err(LazyRegionError::invalid_operation(
                        "crop",
                        format!("width and height must be positive (got {width}x{height})"),
                    ));
                }
                Ok(())
            }
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => {
                let in_range = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
                if !(in_range(*x) && in_range(*y) && in_range(*width) && in_range(*height)) {
                    return Err(LazyRegionError::invalid_operation(
                        "crop",
                        "percent values must be within 0-1",
                    ));
                }
                if *width < DELTA || *height < DELTA {
                    return Err(LazyRegionError::invalid_operation(
                        "crop",
                        "percent width and height must be positive",
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn has_effect(&self, full: Dimension) -> bool {
        match self {
            Crop::Full => false,
            Crop::Square => (full.width - full.height).abs() > DELTA,
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => {
                if *x > 0 || *y > 0 {
                    return true;
                }
                let (w, h) = (*width as f64, *height as f64);
                ((full.width - w).abs() > DELTA || (full.height - h).abs() > DELTA)
                    && (w < full.width || h < full.height)
            }
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => *x > DELTA || *y > DELTA || (width - 1.0).abs() > DELTA || (height - 1.0).abs() > DELTA,
        }
    }

    /// Full-resolution rectangle, clipped to the image.
    pub fn rectangle(&self, full: Dimension) -> Rect {
        self.rectangle_reduced(full, ReductionFactor::default())
    }

    /// Rectangle within an image that has already been reduced by `rf`.
    /// Pixel crops are rescaled by the reduction; percent and square crops are
    /// computed against the reduced size directly.
    pub fn rectangle_reduced(&self, reduced: Dimension, rf: ReductionFactor) -> Rect {
        let rect = match self {
            Crop::Full => Rect::full(reduced),
            Crop::Square => {
                let side = reduced.width.min(reduced.height);
                Rect::new(
                    (reduced.width - side) / 2.0,
                    (reduced.height - side) / 2.0,
                    side,
                    side,
                )
            }
            Crop::Pixels {
                x,
                y,
                width,
                height,
            } => Rect::from_u32(*x, *y, *width, *height).scaled(rf.scale()),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => Rect::new(
                x * reduced.width,
                y * reduced.height,
                width * reduced.width,
                height * reduced.height,
            ),
        };
        rect.clipped_to(reduced)
    }

    /// Re-express this crop against the stored pixel orientation.
    pub fn to_stored(&self, stored_full: Dimension, orientation: Orientation) -> Crop {
        if orientation == Orientation::Rotate0 {
            return self.clone();
        }
        match self {
            Crop::Full | Crop::Square => self.clone(),
            Crop::Percent {
                x,
                y,
                width,
                height,
            } => {
                let r = orientation.unrotate_rect(
                    Rect::new(*x, *y, *width, *height),
                    Dimension::new(1.0, 1.0),
                );
                Crop::Percent {
                    x: r.x.max(0.0),
                    y: r.y.max(0.0),
                    width: r.width,
                    height: r.height,
                }
            }
            Crop::Pixels { .. } => {
                let display = orientation.oriented_size(stored_full);
                let clipped = self.rectangle(display);
                let r = orientation.unrotate_rect(clipped, stored_full);
                Crop::Pixels {
                    x: r.int_x(),
                    y: r.int_y(),
                    width: r.int_width().max(1),
                    height: r.int_height().max(1),
                }
            }
        }
    }
}

// =============================================================================
// SCALE
// =============================================================================

/// Requested output size.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum ScaleTarget {
    /// Keep the region's full size
    #[default]
    Full,
    /// Fraction of the region size (1.0 = unchanged)
    Percent(f64),
    /// Exact width, height follows aspect ratio
    FitWidth(u32),
    /// Exact height, width follows aspect ratio
    FitHeight(u32),
    /// Largest size that fits inside the box, keeping aspect ratio
    FitInside { width: u32, height: u32 },
    /// Exact width and height, ignoring aspect ratio
    Exact { width: u32, height: u32 },
}

/// Resampling filters. Names follow the classic resample filter family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleFilter {
    Box,
    Triangle,
    Bicubic,
    Mitchell,
    Lanczos3,
    Gaussian,
    Hamming,
    Nearest,
}

impl ScaleFilter {
    pub fn from_str(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "box" => Some(Self::Box),
            "triangle" | "bilinear" => Some(Self::Triangle),
            "bicubic" | "catmullrom" => Some(Self::Bicubic),
            "mitchell" => Some(Self::Mitchell),
            "lanczos3" | "lanczos" => Some(Self::Lanczos3),
            "gaussian" => Some(Self::Gaussian),
            "hamming" => Some(Self::Hamming),
            "nearest" => Some(Self::Nearest),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Box => "box",
            Self::Triangle => "triangle",
            Self::Bicubic => "bicubic",
            Self::Mitchell => "mitchell",
            Self::Lanczos3 => "lanczos3",
            Self::Gaussian => "gaussian",
            Self::Hamming => "hamming",
            Self::Nearest => "nearest",
        }
    }

    /// Whether the filter averages samples, and so should see linear light.
    pub fn is_linear(&self) -> bool {
        !matches!(self, Self::Nearest)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Scale {
    pub target: ScaleTarget,
    /// Explicit filter; None lets the engine pick by direction
    pub filter: Option<ScaleFilter>,
}

impl Scale {
    pub fn new(target: ScaleTarget) -> Self {
        Self {
            target,
            filter: None,
        }
    }

    pub fn full() -> Self {
        Self::new(ScaleTarget::Full)
    }

    pub fn percent(percent: f64) -> Self {
        Self::new(ScaleTarget::Percent(percent))
    }

    pub fn fit_width(width: u32) -> Self {
        Self::new(ScaleTarget::FitWidth(width))
    }

    pub fn fit_height(height: u32) -> Self {
        Self::new(ScaleTarget::FitHeight(height))
    }

    pub fn fit_inside(width: u32, height: u32) -> Self {
        Self::new(ScaleTarget::FitInside { width, height })
    }

    pub fn exact(width: u32, height: u32) -> Self {
        Self::new(ScaleTarget::Exact { width, height })
    }

    pub fn with_filter(mut self, filter: ScaleFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn validate(&self) -> OpsResult<()> {
        let ok = match self.target {
            ScaleTarget::Full => true,
            ScaleTarget::Percent(p) => p.is_finite() && p > DELTA,
            ScaleTarget::FitWidth(w) => w > 0,
            ScaleTarget::FitHeight(h) => h > 0,
            ScaleTarget::FitInside { width, height } | ScaleTarget::Exact { width, height } => {
                width > 0 && height > 0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(LazyRegionError::invalid_operation(
                "scale",
                format!("target must be positive: {:?}", self.target),
            ))
        }
    }

    /// True when the scale never changes the region size, whatever it is.
    pub fn is_full(&self) -> bool {
        match self.target {
            ScaleTarget::Full => true,
            ScaleTarget::Percent(p) => (p - 1.0).abs() <= DELTA,
            _ => false,
        }
    }

    /// Horizontal and vertical scale relative to a full-resolution region.
    pub fn resulting_scales(&self, region: Dimension) -> (f64, f64) {
        match self.target {
            ScaleTarget::Full => (1.0, 1.0),
            ScaleTarget::Percent(p) => (p, p),
            ScaleTarget::FitWidth(w) => {
                let s = w as f64 / region.width;
                (s, s)
            }
            ScaleTarget::FitHeight(h) => {
                let s = h as f64 / region.height;
                (s, s)
            }
            ScaleTarget::FitInside { width, height } => {
                let s = (width as f64 / region.width).min(height as f64 / region.height);
                (s, s)
            }
            ScaleTarget::Exact { width, height } => (
                width as f64 / region.width,
                height as f64 / region.height,
            ),
        }
    }

    /// Output pixel size for a full-resolution region.
    pub fn resulting_size(&self, region: Dimension) -> (u32, u32) {
        let round = |v: f64| (v.round() as u32).max(1);
        match self.target {
            ScaleTarget::FitWidth(w) => (w, round(region.height * w as f64 / region.width)),
            ScaleTarget::FitHeight(h) => (round(region.width * h as f64 / region.height), h),
            ScaleTarget::Exact { width, height } => (width, height),
            _ => {
                let (sx, sy) = self.resulting_scales(region);
                (round(region.width * sx), round(region.height * sy))
            }
        }
    }

    pub fn has_effect(&self, region: Dimension) -> bool {
        match self.target {
            ScaleTarget::Full => false,
            ScaleTarget::Percent(p) => (p - 1.0).abs() > DELTA,
            ScaleTarget::FitWidth(w) => (w as f64 - region.width).abs() > DELTA,
            ScaleTarget::FitHeight(h) => (h as f64 - region.height).abs() > DELTA,
            ScaleTarget::FitInside { .. } | ScaleTarget::Exact { .. } => {
                let (w, h) = self.resulting_size(region);
                (w as f64 - region.width).abs() > DELTA || (h as f64 - region.height).abs() > DELTA
            }
        }
    }

    /// Whether the result is larger than the region on either axis.
    pub fn is_upscale(&self, region: Dimension) -> bool {
        let (sx, sy) = self.resulting_scales(region);
        sx.min(sy) > 1.0 + DELTA
    }

    /// Re-express this scale against the stored pixel orientation.
    pub fn to_stored(&self, orientation: Orientation) -> Scale {
        if !orientation.swaps_axes() {
            return *self;
        }
        let target = match self.target {
            ScaleTarget::FitWidth(w) => ScaleTarget::FitHeight(w),
            ScaleTarget::FitHeight(h) => ScaleTarget::FitWidth(h),
            ScaleTarget::FitInside { width, height } => ScaleTarget::FitInside {
                width: height,
                height: width,
            },
            ScaleTarget::Exact { width, height } => ScaleTarget::Exact {
                width: height,
                height: width,
            },
            other => other,
        };
        Scale {
            target,
            filter: self.filter,
        }
    }
}

// =============================================================================
// OTHER GEOMETRIC AND PHOTOMETRIC OPERATIONS
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transpose {
    Horizontal,
    Vertical,
}

impl Transpose {
    /// The flip that, performed before an orientation correction, equals this
    /// flip performed after it.
    pub fn to_stored(&self, orientation: Orientation) -> Transpose {
        match (self, orientation.swaps_axes()) {
            (Transpose::Horizontal, true) => Transpose::Vertical,
            (Transpose::Vertical, true) => Transpose::Horizontal,
            (t, false) => *t,
        }
    }
}

/// Clockwise rotation in degrees. Arbitrary angles expand the canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rotate {
    pub degrees: f64,
}

impl Rotate {
    pub fn new(degrees: f64) -> Self {
        Self { degrees }
    }

    /// Degrees normalized into [0, 360).
    pub fn normalized(&self) -> f64 {
        self.degrees.rem_euclid(360.0)
    }

    pub fn has_effect(&self) -> bool {
        let d = self.normalized();
        d > DELTA && (360.0 - d) > DELTA
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorTransform {
    Gray,
    Bitonal,
}

/// Unsharp mask amount (0 = off).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sharpen {
    pub amount: f64,
}

impl Sharpen {
    pub fn has_effect(&self) -> bool {
        self.amount > DELTA
    }
}

/// Rectangle to black out, in full-resolution coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Redaction {
    pub region: Rect,
}

impl Redaction {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            region: Rect::from_u32(x, y, width, height),
        }
    }

    pub fn has_effect(&self) -> bool {
        !self.region.is_empty()
    }

    /// Region relative to an applied full-resolution crop rectangle; empty
    /// when the redaction lies outside it.
    pub fn resulting_region(&self, crop: &Rect) -> Rect {
        let inside = self.region.intersection(crop);
        if inside.is_empty() {
            return Rect::default();
        }
        inside.translated(-crop.x, -crop.y)
    }
}

// =============================================================================
// OVERLAYS
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const BLACK: Color = Color::rgba(0, 0, 0, 255);
    pub const WHITE: Color = Color::rgba(255, 255, 255, 255);
    pub const TRANSPARENT: Color = Color::rgba(0, 0, 0, 0);

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Parse `#RGB`, `#RRGGBB` or `#RRGGBBAA` (leading `#` optional).
    pub fn from_hex(value: &str) -> OpsResult<Self> {
        let hex = value.trim().trim_start_matches('#');
        let invalid = || {
            LazyRegionError::invalid_argument(
                "color",
                value.to_string(),
                "expected #RGB, #RRGGBB or #RRGGBBAA",
            )
        };
        let byte = |s: &str| u8::from_str_radix(s, 16).map_err(|_| invalid());
        match hex.len() {
            3 => {
                let mut out = [0u8; 3];
                for (i, c) in hex.chars().enumerate() {
                    let v = c.to_digit(16).ok_or_else(invalid)? as u8;
                    out[i] = v * 17;
                }
                Ok(Self::rgba(out[0], out[1], out[2], 255))
            }
            6 => Ok(Self::rgba(
                byte(&hex[0..2])?,
                byte(&hex[2..4])?,
                byte(&hex[4..6])?,
                255,
            )),
            8 => Ok(Self::rgba(
                byte(&hex[0..2])?,
                byte(&hex[2..4])?,
                byte(&hex[4..6])?,
                byte(&hex[6..8])?,
            )),
            _ => Err(invalid()),
        }
    }

    pub fn to_rgba(&self) -> image::Rgba<u8> {
        image::Rgba([self.r, self.g, self.b, self.a])
    }
}

/// Overlay anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Position {
    TopLeft,
    TopCenter,
    TopRight,
    LeftCenter,
    Center,
    RightCenter,
    BottomLeft,
    BottomCenter,
    #[default]
    BottomRight,
    /// Tile across the whole image, starting from the center
    Repeat,
    /// Fit inside the image minus the inset on every side
    Scaled,
}

impl Position {
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().replace(['_', '-', ' '], "").as_str() {
            "topleft" => Some(Self::TopLeft),
            "topcenter" => Some(Self::TopCenter),
            "topright" => Some(Self::TopRight),
            "leftcenter" => Some(Self::LeftCenter),
            "center" => Some(Self::Center),
            "rightcenter" => Some(Self::RightCenter),
            "bottomleft" => Some(Self::BottomLeft),
            "bottomcenter" => Some(Self::BottomCenter),
            "bottomright" => Some(Self::BottomRight),
            "repeat" => Some(Self::Repeat),
            "scaled" => Some(Self::Scaled),
            _ => None,
        }
    }
}

/// Encoded image composited onto the output.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageOverlay {
    pub image: Arc<Vec<u8>>,
    pub position: Position,
    pub inset: u32,
}

/// Text composited onto the output. The font is raw TrueType/OpenType data.
#[derive(Clone, Debug, PartialEq)]
pub struct TextOverlay {
    pub text: String,
    pub font: Arc<Vec<u8>>,
    pub font_size: f32,
    pub min_font_size: f32,
    pub color: Color,
    pub background: Color,
    pub stroke_color: Color,
    pub stroke_width: f32,
    pub position: Position,
    pub inset: u32,
}

impl TextOverlay {
    pub fn new(text: impl Into<String>, font: Arc<Vec<u8>>, font_size: f32) -> Self {
        Self {
            text: text.into(),
            font,
            font_size,
            min_font_size: 12.0_f32.min(font_size),
            color: Color::BLACK,
            background: Color::TRANSPARENT,
            stroke_color: Color::WHITE,
            stroke_width: 0.0,
            position: Position::BottomRight,
            inset: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Overlay {
    Image(ImageOverlay),
    Text(TextOverlay),
}

impl Overlay {
    pub fn has_effect(&self) -> bool {
        match self {
            Overlay::Image(o) => !o.image.is_empty(),
            Overlay::Text(o) => !o.text.trim().is_empty() && o.font_size > 0.0,
        }
    }
}

// =============================================================================
// ENCODE
// =============================================================================

/// Output format for encoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
    WebP,
    Gif,
    Tiff,
}

impl OutputFormat {
    pub fn from_str(format: &str) -> OpsResult<Self> {
        match format.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            "gif" => Ok(Self::Gif),
            "tif" | "tiff" => Ok(Self::Tiff),
            other => Err(LazyRegionError::unsupported_output_format(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::WebP => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tif",
        }
    }

    pub fn supports_alpha(&self) -> bool {
        !matches!(self, Self::Jpeg)
    }
}

/// Embedded color profile.
#[derive(Clone, Debug, PartialEq)]
pub struct IccProfile {
    pub name: String,
    pub data: Arc<Vec<u8>>,
}

/// Encode-time options.
#[derive(Clone, Debug, PartialEq)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    /// 0-100, format-dependent meaning
    pub quality: u8,
    /// Progressive JPEG / interlaced PNG-GIF
    pub interlace: bool,
    /// Format-dependent compression scheme name
    pub compression: Option<String>,
    /// Color to flatten alpha against for formats without alpha
    pub background: Option<Color>,
    /// Maximum bits per sample in the output (8 or 16)
    pub max_sample_size: Option<u8>,
    pub icc_profile: Option<IccProfile>,
}

impl EncodeOptions {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            quality: 80,
            interlace: false,
            compression: None,
            background: None,
            max_sample_size: None,
            icc_profile: None,
        }
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn validate(&self) -> OpsResult<()> {
        if self.quality > 100 {
            return Err(LazyRegionError::invalid_argument(
                "quality",
                self.quality.to_string(),
                "must be within 0-100",
            ));
        }
        if let Some(bits) = self.max_sample_size {
            if bits != 8 && bits != 16 {
                return Err(LazyRegionError::invalid_argument(
                    "max_sample_size",
                    bits.to_string(),
                    "must be 8 or 16",
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// OPERATION / OPERATION LIST
// =============================================================================

/// Image operations. Each variant is self-contained and stateless.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    Crop(Crop),
    Scale(Scale),
    Transpose(Transpose),
    Rotate(Rotate),
    ColorTransform(ColorTransform),
    Sharpen(Sharpen),
    Overlay(Overlay),
    Redaction(Redaction),
    Encode(EncodeOptions),
    /// Contrast stretch across the full sample range
    Normalize,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Crop(_) => "crop",
            Operation::Scale(_) => "scale",
            Operation::Transpose(_) => "transpose",
            Operation::Rotate(_) => "rotate",
            Operation::ColorTransform(_) => "color_transform",
            Operation::Sharpen(_) => "sharpen",
            Operation::Overlay(_) => "overlay",
            Operation::Redaction(_) => "redaction",
            Operation::Encode(_) => "encode",
            Operation::Normalize => "normalize",
        }
    }

    /// Whether applying this operation to an image of `full` size (with the
    /// rest of `ops` in force) would change it.
    pub fn has_effect(&self, full: Dimension, ops: &OperationList) -> bool {
        match self {
            Operation::Crop(crop) => crop.has_effect(full),
            Operation::Scale(scale) => scale.has_effect(ops.crop().rectangle(full).size()),
            Operation::Transpose(_) | Operation::ColorTransform(_) | Operation::Normalize => true,
            Operation::Rotate(rotate) => rotate.has_effect(),
            Operation::Sharpen(sharpen) => sharpen.has_effect(),
            Operation::Overlay(overlay) => overlay.has_effect(),
            Operation::Redaction(redaction) => {
                redaction.has_effect()
                    && !redaction
                        .resulting_region(&ops.crop().rectangle(full))
                        .is_empty()
            }
            Operation::Encode(_) => false,
        }
    }

    pub fn validate(&self) -> OpsResult<()> {
        match self {
            Operation::Crop(crop) => crop.validate(),
            Operation::Scale(scale) => scale.validate(),
            Operation::Rotate(rotate) if !rotate.degrees.is_finite() => Err(
                LazyRegionError::invalid_operation("rotate", "degrees must be finite"),
            ),
            Operation::Sharpen(sharpen) if !(sharpen.amount.is_finite() && sharpen.amount >= 0.0) => {
                Err(LazyRegionError::invalid_operation(
                    "sharpen",
                    "amount must be a non-negative number",
                ))
            }
            Operation::Encode(options) => options.validate(),
            _ => Ok(()),
        }
    }
}

/// Ordered operations for one request. Authoring order is preserved; the
/// engine regroups by kind when it runs them. Singleton kinds (Crop, Scale,
/// Encode) resolve last-wins.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OperationList {
    ops: Vec<Operation>,
}

impl OperationList {
    pub fn new(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn with(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn validate(&self) -> OpsResult<()> {
        self.ops.iter().try_for_each(Operation::validate)
    }

    /// The crop in force (last one wins), or `Crop::Full`.
    pub fn crop(&self) -> Crop {
        self.ops
            .iter()
            .rev()
            .find_map(|op| match op {
                Operation::Crop(crop) => Some(crop.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    /// The scale in force (last one wins), or `Scale::full()`.
    pub fn scale(&self) -> Scale {
        self.ops
            .iter()
            .rev()
            .find_map(|op| match op {
                Operation::Scale(scale) => Some(*scale),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn redactions(&self) -> impl Iterator<Item = &Redaction> {
        self.ops.iter().filter_map(|op| match op {
            Operation::Redaction(r) => Some(r),
            _ => None,
        })
    }

    pub fn overlays(&self) -> impl Iterator<Item = &Overlay> {
        self.ops.iter().filter_map(|op| match op {
            Operation::Overlay(o) => Some(o),
            _ => None,
        })
    }

    pub fn encode(&self) -> Option<&EncodeOptions> {
        self.ops.iter().rev().find_map(|op| match op {
            Operation::Encode(options) => Some(options),
            _ => None,
        })
    }

    pub fn output_format(&self) -> Option<OutputFormat> {
        self.encode().map(|options| options.format)
    }

    pub fn wants_normalize(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Operation::Normalize))
    }

    /// Whether any operation would change an image of `full` size.
    pub fn has_effect(&self, full: Dimension) -> bool {
        self.ops.iter().any(|op| op.has_effect(full, self))
    }

    /// Output size after crop, scale and rotation, ignoring overlays.
    pub fn resulting_size(&self, full: Dimension) -> (u32, u32) {
        let region = self.crop().rectangle(full).size();
        let (mut w, mut h) = self.scale().resulting_size(region);
        for op in &self.ops {
            if let Operation::Rotate(rotate) = op {
                if rotate.has_effect() {
                    let radians = rotate.normalized().to_radians();
                    let (sin, cos) = (radians.sin().abs(), radians.cos().abs());
                    let (fw, fh) = (w as f64, h as f64);
                    w = (fw * cos + fh * sin).round() as u32;
                    h = (fh * cos + fw * sin).round() as u32;
                }
            }
        }
        (w, h)
    }
}

impl FromIterator<Operation> for OperationList {
    fn from_iter<T: IntoIterator<Item = Operation>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a OperationList {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
