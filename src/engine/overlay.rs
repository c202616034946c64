// src/engine/overlay.rs
//
// Image and text overlays composited onto the output raster.

use crate::engine::raster::Raster;
use crate::engine::resize;
use crate::ops::{Color, ImageOverlay, Overlay, Position, ScaleFilter, TextOverlay};
use ab_glyph::{Font, FontRef, PxScale, ScaleFont};
use image::{imageops, DynamicImage, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size, Blend};
use imageproc::rect::Rect;
use std::time::Instant;
use tracing::{debug, warn};

/// Padding between text and its background box, when the box is visible.
const TEXT_BOX_PADDING: u32 = 5;

/// Composite `overlay` onto `raster`. Overlays that cannot be applied are
/// logged and skipped; the raster is returned unchanged.
pub fn apply(raster: Raster, overlay: &Overlay) -> Raster {
    if !overlay.has_effect() {
        return raster;
    }
    let started = Instant::now();
    let mut base = raster.image.to_rgba8();
    let applied = match overlay {
        Overlay::Image(o) => overlay_image(&mut base, o),
        Overlay::Text(o) => overlay_text(&mut base, o),
    };
    if !applied {
        return raster;
    }
    debug!(
        target: "lazy_region::overlay",
        width = base.width(),
        height = base.height(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "applied overlay"
    );
    raster.with_image(DynamicImage::ImageRgba8(base))
}

/// Top-left corner of an item of `item` size anchored at `position`.
/// Repeat and Scaled have no single anchor and are placed centered.
pub fn anchor_origin(position: Position, base: (u32, u32), item: (u32, u32), inset: u32) -> (i64, i64) {
    let (bw, bh) = (base.0 as i64, base.1 as i64);
    let (iw, ih) = (item.0 as i64, item.1 as i64);
    let inset = inset as i64;
    let left = inset;
    let top = inset;
    let right = bw - iw - inset;
    let bottom = bh - ih - inset;
    let center_x = (bw - iw) / 2;
    let center_y = (bh - ih) / 2;
    match position {
        Position::TopLeft => (left, top),
        Position::TopCenter => (center_x, top),
        Position::TopRight => (right, top),
        Position::LeftCenter => (left, center_y),
        Position::Center | Position::Repeat | Position::Scaled => (center_x, center_y),
        Position::RightCenter => (right, center_y),
        Position::BottomLeft => (left, bottom),
        Position::BottomCenter => (center_x, bottom),
        Position::BottomRight => (right, bottom),
    }
}

/// Origins of the tiles covering `base`, starting from a tile whose corner
/// sits at the center and stepping outward.
pub fn repeat_origins(base: (u32, u32), tile: (u32, u32)) -> Vec<(i64, i64)> {
    let (bw, bh) = (base.0 as i64, base.1 as i64);
    let (tw, th) = (tile.0.max(1) as i64, tile.1.max(1) as i64);
    let mut start_x = (base.0 as f64 / 2.0).round() as i64;
    let mut start_y = (base.1 as f64 / 2.0).round() as i64;
    while start_x > 0 {
        start_x -= tw;
    }
    while start_y > 0 {
        start_y -= th;
    }
    let mut origins = Vec::new();
    let mut x = start_x;
    while x < bw {
        let mut y = start_y;
        while y < bh {
            origins.push((x, y));
            y += th;
        }
        x += tw;
    }
    origins
}

fn overlay_image(base: &mut RgbaImage, overlay: &ImageOverlay) -> bool {
    let decoded = match image::load_from_memory(&overlay.image) {
        Ok(img) => img,
        Err(e) => {
            warn!(target: "lazy_region::overlay", error = %e, "skipping undecodable overlay image");
            return false;
        }
    };
    let base_size = base.dimensions();

    match overlay.position {
        Position::Repeat => {
            let tile = decoded.to_rgba8();
            for (x, y) in repeat_origins(base_size, tile.dimensions()) {
                imageops::overlay(base, &tile, x, y);
            }
        }
        Position::Scaled => {
            let avail_w = base_size.0.saturating_sub(overlay.inset * 2);
            let avail_h = base_size.1.saturating_sub(overlay.inset * 2);
            let avail_w = if avail_w > 0 { avail_w } else { base_size.0 };
            let avail_h = if avail_h > 0 { avail_h } else { base_size.1 };
            let s = (avail_w as f64 / decoded.width() as f64)
                .min(avail_h as f64 / decoded.height() as f64);
            let w = ((decoded.width() as f64 * s).round() as u32).max(1);
            let h = ((decoded.height() as f64 * s).round() as u32).max(1);
            let scaled = match resize::resize(decoded, w, h, ScaleFilter::Bicubic, false) {
                Ok(img) => img.to_rgba8(),
                Err(e) => {
                    warn!(target: "lazy_region::overlay", error = %e.reason, "skipping unscalable overlay image");
                    return false;
                }
            };
            let (x, y) = anchor_origin(Position::Center, base_size, scaled.dimensions(), 0);
            imageops::overlay(base, &scaled, x, y);
        }
        position => {
            let top = decoded.to_rgba8();
            let (x, y) = anchor_origin(position, base_size, top.dimensions(), overlay.inset);
            imageops::overlay(base, &top, x, y);
        }
    }
    true
}

/// Largest font size, counting down from `start` in 1 pt steps to `min`,
/// whose measured text fits inside `bounds`. `measure` returns the widest
/// line and total height at a given size.
pub fn fit_font_size(
    start: f32,
    min: f32,
    bounds: (u32, u32),
    measure: impl Fn(f32) -> (u32, u32),
) -> Option<f32> {
    let mut size = start;
    loop {
        let (w, h) = measure(size);
        if w <= bounds.0 && h <= bounds.1 {
            return Some(size);
        }
        if size - 1.0 >= min && size - 1.0 > 0.0 {
            size -= 1.0;
        } else {
            return None;
        }
    }
}

/// Measures and draws text at one font size.
struct TextLayout<'f> {
    font: &'f FontRef<'f>,
    scale: PxScale,
}

impl TextLayout<'_> {
    fn line_height(&self) -> u32 {
        let scaled = self.font.as_scaled(self.scale);
        (scaled.height() + scaled.line_gap()).ceil().max(1.0) as u32
    }

    fn line_width(&self, line: &str) -> u32 {
        text_size(self.scale, self.font, line).0
    }

    fn measure(&self, lines: &[&str]) -> (u32, u32) {
        let widest = lines.iter().map(|l| self.line_width(l)).max().unwrap_or(0);
        (widest, self.line_height() * lines.len() as u32)
    }

    fn draw_line(&self, target: &mut RgbaImage, line: &str, origin: (i32, i32), color: Color) {
        draw_text_mut(
            target,
            color.to_rgba(),
            origin.0,
            origin.1,
            self.scale,
            self.font,
            line,
        );
    }
}

fn overlay_text(base: &mut RgbaImage, overlay: &TextOverlay) -> bool {
    let font = match FontRef::try_from_slice(&overlay.font) {
        Ok(font) => font,
        Err(e) => {
            warn!(target: "lazy_region::overlay", error = %e, "skipping text overlay with invalid font");
            return false;
        }
    };
    let lines: Vec<&str> = overlay.text.split('\n').collect();
    let padding = if overlay.background.a > 0 {
        TEXT_BOX_PADDING
    } else {
        0
    };
    let margin = overlay.inset * 2 + padding * 2;
    let (bw, bh) = base.dimensions();
    let bounds = (bw.saturating_sub(margin), bh.saturating_sub(margin));

    let measure = |size: f32| {
        TextLayout {
            font: &font,
            scale: PxScale::from(size),
        }
        .measure(&lines)
    };
    let Some(size) = fit_font_size(overlay.font_size, overlay.min_font_size, bounds, measure) else {
        debug!(
            target: "lazy_region::overlay",
            min_font_size = overlay.min_font_size,
            width = bw,
            height = bh,
            "text will not fit; skipping overlay"
        );
        return false;
    };

    let layout = TextLayout {
        font: &font,
        scale: PxScale::from(size),
    };
    let (text_w, text_h) = layout.measure(&lines);
    let box_size = (text_w + padding * 2, text_h + padding * 2);
    let (box_x, box_y) = anchor_origin(overlay.position, (bw, bh), box_size, overlay.inset);

    if overlay.background.a > 0 {
        let rect = Rect::at(box_x as i32, box_y as i32).of_size(box_size.0, box_size.1);
        let mut canvas = Blend(std::mem::take(base));
        draw_filled_rect_mut(&mut canvas, rect, overlay.background.to_rgba());
        *base = canvas.0;
    }

    let line_height = layout.line_height();
    let stroke = overlay.stroke_width.max(0.0).round() as i32;
    for (i, line) in lines.iter().enumerate() {
        let line_w = layout.line_width(line);
        let x = match overlay.position {
            Position::TopLeft | Position::LeftCenter | Position::BottomLeft => box_x + padding as i64,
            Position::TopRight | Position::RightCenter | Position::BottomRight => {
                box_x + (text_w - line_w) as i64 + padding as i64
            }
            _ => box_x + (box_size.0 as i64 - line_w as i64) / 2,
        };
        let y = box_y + padding as i64 + (line_height as i64 * i as i64);
        let origin = (x as i32, y as i32);
        if stroke > 0 {
            for dy in -stroke..=stroke {
                for dx in -stroke..=stroke {
                    if (dx, dy) != (0, 0) && dx * dx + dy * dy <= stroke * stroke {
                        layout.draw_line(
                            base,
                            line,
                            (origin.0 + dx, origin.1 + dy),
                            overlay.stroke_color,
                        );
                    }
                }
            }
        }
        layout.draw_line(base, line, origin, overlay.color);
    }
    debug!(
        target: "lazy_region::overlay",
        font_size = size,
        requested = overlay.font_size,
        lines = lines.len(),
        "drew text overlay"
    );
    true
}
