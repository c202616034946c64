// src/engine/pyramid.rs
//
// Decomposition levels and the level selector.
//
// The selector walks the available levels from smallest to largest and keeps
// the first one whose resolution still covers what the Scale demands of the
// cropped region. Anything smaller would lose required detail; anything larger
// wastes decode time and memory.

use crate::engine::reduction::ReductionFactor;
use crate::ops::{Crop, Dimension, Scale, ScaleTarget};
use tracing::debug;

/// One resolution of a multi-resolution source. Index 0 is full resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecompositionLevel {
    pub index: usize,
    pub width: u32,
    pub height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl DecompositionLevel {
    pub fn new(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            tile_width: width,
            tile_height: height,
        }
    }

    pub fn with_tile_size(mut self, tile_width: u32, tile_height: u32) -> Self {
        self.tile_width = tile_width;
        self.tile_height = tile_height;
        self
    }

    pub fn size(&self) -> Dimension {
        Dimension::from_u32(self.width, self.height)
    }
}

/// Level picked for a request, with the reduction it implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelSelection {
    pub level_index: usize,
    pub factor: ReductionFactor,
}

impl LevelSelection {
    pub fn full_resolution() -> Self {
        Self {
            level_index: 0,
            factor: ReductionFactor::default(),
        }
    }
}

/// Sizes of a pyramid built by repeated ceiling halving, full size first.
/// Stops before either side would drop below `min_size`, and never yields
/// more than `max_levels` entries.
pub fn halved_sizes(width: u32, height: u32, min_size: u32, max_levels: usize) -> Vec<(u32, u32)> {
    let mut sizes = vec![(width, height)];
    let (mut w, mut h) = (width, height);
    while sizes.len() < max_levels {
        let (nw, nh) = (w.div_ceil(2), h.div_ceil(2));
        if nw < min_size.max(1) || nh < min_size.max(1) || (nw, nh) == (w, h) {
            break;
        }
        sizes.push((nw, nh));
        (w, h) = (nw, nh);
    }
    sizes
}

pub struct PyramidSelector;

impl PyramidSelector {
    /// Levels for a list of `(width, height)` sizes given in index order.
    pub fn levels_from_sizes(sizes: &[(u32, u32)]) -> Vec<DecompositionLevel> {
        sizes
            .iter()
            .enumerate()
            .map(|(index, &(w, h))| DecompositionLevel::new(index, w, h))
            .collect()
    }

    /// Pick the smallest level that still satisfies `scale` over `crop`.
    ///
    /// `full` and the crop/scale must share one orientation (the stored
    /// orientation of the levels).
    pub fn select(
        full: Dimension,
        levels: &[DecompositionLevel],
        crop: &Crop,
        scale: &Scale,
    ) -> LevelSelection {
        if levels.len() <= 1 || full.is_empty() {
            return LevelSelection::full_resolution();
        }

        let region = crop.rectangle(full).size();
        if region.is_empty() || !scale.has_effect(region) {
            debug!(
                target: "lazy_region::pyramid",
                "scale has no effect; reading full-resolution level"
            );
            return LevelSelection::full_resolution();
        }

        let (required_x, required_y) = required_scales(scale, region);

        let mut ordered: Vec<&DecompositionLevel> = levels
            .iter()
            .filter(|level| level.width > 0 && level.height > 0)
            .collect();
        ordered.sort_by(|a, b| b.width.cmp(&a.width));

        for level in ordered.iter().rev() {
            let level_scale_x = level.width as f64 / full.width;
            let level_scale_y = level.height as f64 / full.height;
            let fits = required_x.is_none_or(|r| r <= level_scale_x)
                && required_y.is_none_or(|r| r <= level_scale_y);
            if fits {
                let factor = ReductionFactor::for_level(full, level.size());
                debug!(
                    target: "lazy_region::pyramid",
                    level = level.index,
                    width = level.width,
                    height = level.height,
                    factor = factor.factor(),
                    "selected decomposition level"
                );
                return LevelSelection {
                    level_index: level.index,
                    factor,
                };
            }
        }

        LevelSelection::full_resolution()
    }
}

/// Fraction of full resolution the scale needs along each constraining axis.
/// `None` means the axis does not constrain the choice. Never above 1, since
/// no level carries more detail than full resolution.
fn required_scales(scale: &Scale, region: Dimension) -> (Option<f64>, Option<f64>) {
    let ratio = |target: u32, extent: f64| (target as f64).min(extent) / extent;
    match scale.target {
        ScaleTarget::Full => (Some(1.0), Some(1.0)),
        ScaleTarget::Percent(p) => {
            let p = p.min(1.0);
            (Some(p), Some(p))
        }
        ScaleTarget::FitWidth(w) => (Some(ratio(w, region.width)), None),
        ScaleTarget::FitHeight(h) => (None, Some(ratio(h, region.height))),
        ScaleTarget::FitInside { .. } => {
            let (s, _) = scale.resulting_scales(region);
            let s = s.min(1.0);
            (Some(s), Some(s))
        }
        ScaleTarget::Exact { width, height } => (
            Some(ratio(width, region.width)),
            Some(ratio(height, region.height)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pyramid() -> Vec<DecompositionLevel> {
        PyramidSelector::levels_from_sizes(&[(4000, 3000), (2000, 1500), (1000, 750), (500, 375)])
    }

    fn full() -> Dimension {
        Dimension::from_u32(4000, 3000)
    }

    #[test]
    fn test_full_scale_reads_level_zero() {
        let sel = PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::full());
        assert_eq!(sel, LevelSelection::full_resolution());
    }

    #[test]
    fn test_exact_match_selects_smallest_level() {
        let sel = PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::fit_width(500));
        assert_eq!(sel.level_index, 3);
        assert_eq!(sel.factor.factor(), 3);
    }

    #[test]
    fn test_cropped_request_selects_quarter_level() {
        let sel = PyramidSelector::select(
            full(),
            &pyramid(),
            &Crop::pixels(0, 0, 2000, 1500),
            &Scale::fit_width(500),
        );
        assert_eq!(sel.level_index, 2);
        assert_eq!(sel.factor.factor(), 2);
    }

    #[test]
    fn test_slightly_larger_target_moves_up_a_level() {
        let sel = PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::fit_width(501));
        assert_eq!(sel.level_index, 2);
    }

    #[test]
    fn test_upscale_reads_level_zero() {
        let sel = PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::percent(1.5));
        assert_eq!(sel.level_index, 0);
        let sel = PyramidSelector::select(
            full(),
            &pyramid(),
            &Crop::pixels(0, 0, 100, 100),
            &Scale::fit_width(400),
        );
        assert_eq!(sel.level_index, 0);
    }

    #[test]
    fn test_fit_height_only_checks_vertical_axis() {
        let sel = PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::fit_height(800));
        assert_eq!(sel.level_index, 1);
        assert_eq!(sel.factor.factor(), 1);
    }

    #[test]
    fn test_exact_uses_most_demanding_axis() {
        let sel =
            PyramidSelector::select(full(), &pyramid(), &Crop::Full, &Scale::exact(500, 1500));
        assert_eq!(sel.level_index, 1);
    }

    #[test]
    fn test_unsorted_levels_are_walked_by_size() {
        let mut levels = pyramid();
        levels.reverse();
        let sel = PyramidSelector::select(full(), &levels, &Crop::Full, &Scale::percent(0.3));
        assert_eq!(sel.level_index, 1);
    }

    #[test]
    fn test_empty_and_single_level_lists() {
        let sel = PyramidSelector::select(full(), &[], &Crop::Full, &Scale::percent(0.1));
        assert_eq!(sel, LevelSelection::full_resolution());
        let single = PyramidSelector::levels_from_sizes(&[(4000, 3000)]);
        let sel = PyramidSelector::select(full(), &single, &Crop::Full, &Scale::percent(0.1));
        assert_eq!(sel, LevelSelection::full_resolution());
    }

    #[test]
    fn test_ceil_halved_levels_keep_exact_factor() {
        let sizes = halved_sizes(4001, 3001, 1, 4);
        assert_eq!(sizes, vec![(4001, 3001), (2001, 1501), (1001, 751), (501, 376)]);
        let levels = PyramidSelector::levels_from_sizes(&sizes);
        let sel = PyramidSelector::select(
            Dimension::from_u32(4001, 3001),
            &levels,
            &Crop::Full,
            &Scale::fit_width(500),
        );
        assert_eq!(sel.level_index, 3);
        assert_eq!(sel.factor.factor(), 3);
    }

    #[test]
    fn test_halved_sizes_respects_min_size() {
        assert_eq!(halved_sizes(16, 10, 4, 10), vec![(16, 10), (8, 5)]);
        assert_eq!(halved_sizes(1, 1, 1, 10), vec![(1, 1)]);
    }
}
