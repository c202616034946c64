// src/engine/reduction.rs
//
// Count of halvings already applied to a raster relative to full resolution.
// Values are combined explicitly at each stage rather than mutated in place.

use crate::ops::Dimension;

/// Largest factor the uncapped search will ever return. 2^-32 of any real
/// image is far below a single pixel.
const MAX_SEARCH_FACTOR: u32 = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReductionFactor {
    factor: u32,
}

impl ReductionFactor {
    pub const fn new(factor: u32) -> Self {
        Self { factor }
    }

    pub fn factor(&self) -> u32 {
        self.factor
    }

    /// Linear scale of data at this factor, `2^-factor`.
    pub fn scale(&self) -> f64 {
        0.5f64.powi(self.factor as i32)
    }

    /// Subsampling stride equivalent to this factor, `2^factor`.
    pub fn stride(&self) -> u32 {
        1u32.checked_shl(self.factor).unwrap_or(u32::MAX)
    }

    /// Largest factor whose scale still delivers at least `scale`, capped at
    /// `max_factor`.
    ///
    /// The loop only advances while the next halving would still be at or
    /// above the requested fraction, so `2^-factor >= scale` always holds.
    pub fn for_scale(scale: f64, max_factor: u32) -> Self {
        Self::for_scale_tolerant(scale, 0.0, max_factor)
    }

    /// `for_scale` without a cap.
    pub fn for_scale_uncapped(scale: f64) -> Self {
        Self::for_scale_tolerant(scale, 0.0, MAX_SEARCH_FACTOR)
    }

    /// Like `for_scale`, but a scale up to `tolerance` above a power of two
    /// counts as that power of two. Pyramid levels halved with ceiling
    /// rounding are a fraction of a pixel larger than an exact halving; this
    /// keeps their bookkeeping factor in line with the level they really are.
    pub fn for_scale_tolerant(scale: f64, tolerance: f64, max_factor: u32) -> Self {
        if !(scale.is_finite() && scale > 0.0) {
            return Self::new(0);
        }
        let mut factor = 0u32;
        let mut next = 0.5f64;
        while scale <= next + tolerance && factor < max_factor {
            next /= 2.0;
            factor += 1;
        }
        Self::new(factor)
    }

    /// Factor of a pyramid level relative to the full image.
    pub fn for_level(full: Dimension, level: Dimension) -> Self {
        if full.width <= 0.0 || level.width <= 0.0 {
            return Self::new(0);
        }
        // A ceil-halved level exceeds its exact ratio by at most one pixel.
        let tolerance = 1.0 / full.width;
        Self::for_scale_tolerant(level.width / full.width, tolerance, MAX_SEARCH_FACTOR)
    }

    /// Sum of both factors; each contributes an independent halving.
    pub fn combine(a: ReductionFactor, b: ReductionFactor) -> Self {
        Self::new(a.factor.saturating_add(b.factor))
    }

    /// `size` reduced by this factor.
    pub fn reduced_size(&self, size: Dimension) -> Dimension {
        size.scaled(self.scale())
    }
}

impl std::fmt::Display for ReductionFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (scale {})", self.factor, self.scale())
    }
}
