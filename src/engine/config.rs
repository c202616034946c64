// src/engine/config.rs
//
// Processor configuration and the format registry. Both are plain values
// injected into the Processor; nothing here is global.

use crate::engine::decoder::SourceFormat;
use crate::error::LazyRegionError;
use crate::ops::{Color, OutputFormat, ScaleFilter};
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use std::collections::HashSet;
use std::time::Duration;

type ConfigResult<T> = std::result::Result<T, LazyRegionError>;

const DEFAULT_FRAME_JOIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_QUALITY: u8 = 80;
const FAST_QUALITY: u8 = 70;
const HIGH_QUALITY: u8 = 92;
const QUALITY_SHARPEN: f64 = 0.2;

pub const ENV_THREADS: &str = "LAZY_REGION_THREADS";
pub const ENV_FRAME_JOIN_TIMEOUT_MS: &str = "LAZY_REGION_FRAME_JOIN_TIMEOUT_MS";
pub const ENV_UPSCALE_FILTER: &str = "LAZY_REGION_UPSCALE_FILTER";
pub const ENV_DOWNSCALE_FILTER: &str = "LAZY_REGION_DOWNSCALE_FILTER";

#[derive(Clone, Debug, PartialEq)]
pub struct ProcessorConfig {
    pub upscale_filter: ScaleFilter,
    pub downscale_filter: ScaleFilter,
    /// Unsharp amount applied after scaling; 0 disables it
    pub sharpen: f64,
    pub normalize: bool,
    pub max_dimension: u32,
    pub max_pixels: u64,
    pub frame_join_timeout: Duration,
    /// Worker threads for multi-frame work; 0 uses available parallelism
    pub threads: usize,
    pub jpeg_progressive: bool,
    pub default_quality: u8,
    /// Output format when the operation list carries no Encode
    pub default_format: OutputFormat,
    /// Flattening color for outputs without alpha
    pub background: Color,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            upscale_filter: ScaleFilter::Bicubic,
            downscale_filter: ScaleFilter::Box,
            sharpen: 0.0,
            normalize: false,
            max_dimension: MAX_DIMENSION,
            max_pixels: MAX_PIXELS,
            frame_join_timeout: DEFAULT_FRAME_JOIN_TIMEOUT,
            threads: 0,
            jpeg_progressive: false,
            default_quality: DEFAULT_QUALITY,
            default_format: OutputFormat::Jpeg,
            background: Color::WHITE,
        }
    }
}

impl ProcessorConfig {
    pub fn standard() -> Self {
        Self::default()
    }

    /// Cheapest filters, no post-scale sharpening.
    pub fn fast() -> Self {
        Self {
            upscale_filter: ScaleFilter::Triangle,
            downscale_filter: ScaleFilter::Box,
            default_quality: FAST_QUALITY,
            ..Self::default()
        }
    }

    pub fn quality() -> Self {
        Self {
            upscale_filter: ScaleFilter::Lanczos3,
            downscale_filter: ScaleFilter::Lanczos3,
            sharpen: QUALITY_SHARPEN,
            jpeg_progressive: true,
            default_quality: HIGH_QUALITY,
            ..Self::default()
        }
    }

    pub fn with_upscale_filter(mut self, filter: ScaleFilter) -> Self {
        self.upscale_filter = filter;
        self
    }

    pub fn with_downscale_filter(mut self, filter: ScaleFilter) -> Self {
        self.downscale_filter = filter;
        self
    }

    pub fn with_sharpen(mut self, amount: f64) -> Self {
        self.sharpen = amount.max(0.0);
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_limits(mut self, max_dimension: u32, max_pixels: u64) -> Self {
        self.max_dimension = max_dimension;
        self.max_pixels = max_pixels;
        self
    }

    pub fn with_frame_join_timeout(mut self, timeout: Duration) -> Self {
        self.frame_join_timeout = timeout;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_default_format(mut self, format: OutputFormat) -> Self {
        self.default_format = format;
        self
    }

    pub fn with_background(mut self, background: Color) -> Self {
        self.background = background;
        self
    }

    /// Number of worker threads to build the pool with.
    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            return self.threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    /// Filter for a scale, given whether it enlarges the image.
    pub fn filter_for(&self, requested: Option<ScaleFilter>, upscale: bool) -> ScaleFilter {
        requested.unwrap_or(if upscale {
            self.upscale_filter
        } else {
            self.downscale_filter
        })
    }

    /// Apply `LAZY_REGION_*` overrides from the process environment.
    pub fn from_env(base: Self) -> ConfigResult<Self> {
        Self::from_lookup(base, |key| std::env::var(key).ok())
    }

    fn from_lookup(mut base: Self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        if let Some(raw) = lookup(ENV_THREADS) {
            base.threads = raw.trim().parse().map_err(|_| {
                LazyRegionError::invalid_argument(ENV_THREADS, raw.clone(), "expected a thread count")
            })?;
        }
        if let Some(raw) = lookup(ENV_FRAME_JOIN_TIMEOUT_MS) {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                LazyRegionError::invalid_argument(
                    ENV_FRAME_JOIN_TIMEOUT_MS,
                    raw.clone(),
                    "expected milliseconds",
                )
            })?;
            base.frame_join_timeout = Duration::from_millis(ms);
        }
        let filter = |key: &'static str, raw: String| {
            ScaleFilter::from_str(raw.trim())
                .ok_or_else(|| LazyRegionError::invalid_argument(key, raw, "unknown filter"))
        };
        if let Some(raw) = lookup(ENV_UPSCALE_FILTER) {
            base.upscale_filter = filter(ENV_UPSCALE_FILTER, raw)?;
        }
        if let Some(raw) = lookup(ENV_DOWNSCALE_FILTER) {
            base.downscale_filter = filter(ENV_DOWNSCALE_FILTER, raw)?;
        }
        Ok(base)
    }
}

/// Which formats the processor may read and write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatRegistry {
    sources: HashSet<SourceFormat>,
    outputs: HashSet<OutputFormat>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self {
            sources: [
                SourceFormat::Jpeg,
                SourceFormat::Png,
                SourceFormat::WebP,
                SourceFormat::Gif,
                SourceFormat::Tiff,
                SourceFormat::Bmp,
                SourceFormat::Jpeg2000,
            ]
            .into_iter()
            .collect(),
            outputs: [
                OutputFormat::Jpeg,
                OutputFormat::Png,
                OutputFormat::WebP,
                OutputFormat::Gif,
                OutputFormat::Tiff,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self {
            sources: HashSet::new(),
            outputs: HashSet::new(),
        }
    }

    pub fn with_source(mut self, format: SourceFormat) -> Self {
        self.sources.insert(format);
        self
    }

    pub fn with_output(mut self, format: OutputFormat) -> Self {
        self.outputs.insert(format);
        self
    }

    pub fn without_output(mut self, format: OutputFormat) -> Self {
        self.outputs.remove(&format);
        self
    }

    pub fn supports_source(&self, format: SourceFormat) -> bool {
        self.sources.contains(&format)
    }

    pub fn supports_output(&self, format: OutputFormat) -> bool {
        self.outputs.contains(&format)
    }

    pub fn check_source(&self, format: SourceFormat) -> ConfigResult<()> {
        if self.supports_source(format) {
            Ok(())
        } else {
            Err(LazyRegionError::unsupported_source_format(format.name()))
        }
    }

    pub fn check_output(&self, format: OutputFormat) -> ConfigResult<()> {
        if self.supports_output(format) {
            Ok(())
        } else {
            Err(LazyRegionError::unsupported_output_format(format.name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    mod config_tests {
        use super::*;

        #[test]
        fn test_default_filters_and_timeout() {
            let config = ProcessorConfig::default();
            assert_eq!(config.downscale_filter, ScaleFilter::Box);
            assert_eq!(config.upscale_filter, ScaleFilter::Bicubic);
            assert_eq!(config.frame_join_timeout, Duration::from_secs(300));
            assert_eq!(config.filter_for(None, true), ScaleFilter::Bicubic);
            assert_eq!(
                config.filter_for(Some(ScaleFilter::Nearest), true),
                ScaleFilter::Nearest
            );
        }

        #[test]
        fn test_presets_differ() {
            assert_eq!(ProcessorConfig::standard(), ProcessorConfig::default());
            assert!(ProcessorConfig::quality().sharpen > 0.0);
            assert!(ProcessorConfig::quality().jpeg_progressive);
            assert!(ProcessorConfig::fast().default_quality < DEFAULT_QUALITY);
        }

        #[test]
        fn test_worker_threads_explicit() {
            assert_eq!(ProcessorConfig::default().with_threads(3).worker_threads(), 3);
            assert!(ProcessorConfig::default().worker_threads() >= 1);
        }

        #[test]
        fn test_env_overrides() {
            let config = ProcessorConfig::from_lookup(
                ProcessorConfig::default(),
                lookup(&[
                    (ENV_THREADS, "6"),
                    (ENV_FRAME_JOIN_TIMEOUT_MS, "1500"),
                    (ENV_DOWNSCALE_FILTER, "lanczos3"),
                ]),
            )
            .unwrap();
            assert_eq!(config.threads, 6);
            assert_eq!(config.frame_join_timeout, Duration::from_millis(1500));
            assert_eq!(config.downscale_filter, ScaleFilter::Lanczos3);
            assert_eq!(config.upscale_filter, ScaleFilter::Bicubic);
        }

        #[test]
        fn test_env_invalid_values() {
            let err = ProcessorConfig::from_lookup(
                ProcessorConfig::default(),
                lookup(&[(ENV_THREADS, "lots")]),
            )
            .unwrap_err();
            assert!(matches!(err, LazyRegionError::InvalidArgument { .. }));
            assert!(ProcessorConfig::from_lookup(
                ProcessorConfig::default(),
                lookup(&[(ENV_UPSCALE_FILTER, "sinc")]),
            )
            .is_err());
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_default_registry_supports_everything() {
            let registry = FormatRegistry::default();
            assert!(registry.supports_source(SourceFormat::Jpeg2000));
            assert!(registry.check_output(OutputFormat::Tiff).is_ok());
        }

        #[test]
        fn test_missing_formats_are_rejected() {
            let registry = FormatRegistry::empty().with_source(SourceFormat::Png);
            assert!(registry.check_source(SourceFormat::Png).is_ok());
            assert!(matches!(
                registry.check_source(SourceFormat::Gif),
                Err(LazyRegionError::UnsupportedSourceFormat { .. })
            ));
            assert!(matches!(
                registry.check_output(OutputFormat::Png),
                Err(LazyRegionError::UnsupportedOutputFormat { .. })
            ));
            let registry = FormatRegistry::default().without_output(OutputFormat::Gif);
            assert!(!registry.supports_output(OutputFormat::Gif));
        }
    }
}
