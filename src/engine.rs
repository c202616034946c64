// src/engine.rs
//
// The core of lazy-region. A request flows through:
// 1. Format checks against the injected FormatRegistry (before any decode)
// 2. Level selection on the source pyramid and region planning
// 3. One region read from the decoder backend
// 4. The operation pipeline over the reduced raster
// 5. Encoding into the caller's sink
//
// This file is the facade over the decomposed modules in engine/.

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Images larger than 32768x32768 are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

pub mod color;
mod common;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod frames;
pub mod io;
pub mod overlay;
pub mod pipeline;
pub mod process;
pub mod pyramid;
pub mod raster;
pub mod reduction;
pub mod region;
pub mod resize;
pub mod retrieval;

pub use common::run_with_panic_policy;
pub use config::{FormatRegistry, ProcessorConfig};
pub use decoder::{
    check_dimensions, DecodedRaster, DecoderBackend, JpegBackend, RasterBackend, SourceFormat,
    SourceFrame,
};
pub use encoder::{EncodedFrame, Encoder, ImageEncoder};
pub use frames::FrameProcessor;
pub use io::{extract_icc_profile, ByteSource};
pub use pipeline::{Pipeline, MIN_RESAMPLE_DIMENSION};
pub use process::{ProcessBackend, ProcessCommand};
pub use pyramid::{DecompositionLevel, LevelSelection, PyramidSelector};
pub use raster::Raster;
pub use reduction::ReductionFactor;
pub use region::{DecodeRegion, ReaderHints, RegionPlan, RegionReader};
pub use resize::ResizeError;
pub use retrieval::{
    DownloadRegistry, FileStreamSource, RetrievalStrategy, Retriever, StreamSource,
    MAX_RETRIEVAL_ATTEMPTS,
};

// =============================================================================
// PROCESSOR
// =============================================================================

use crate::error::LazyRegionError;
use crate::ops::{Dimension, EncodeOptions, IccProfile, OperationList, Orientation, OutputFormat};
use rayon::ThreadPool;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

type ProcessResult<T> = std::result::Result<T, LazyRegionError>;

/// What a request did, for logging and response headers.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessInfo {
    pub level_index: usize,
    pub total_factor: ReductionFactor,
    pub region: DecodeRegion,
    pub output_width: u32,
    pub output_height: u32,
    pub frames: usize,
}

/// Owns the configuration, the format registry, the encoder and the worker
/// pool. Dropping it shuts the pool down.
pub struct Processor {
    config: ProcessorConfig,
    registry: FormatRegistry,
    encoder: Box<dyn Encoder>,
    pool: Arc<ThreadPool>,
}

impl Processor {
    pub fn new(config: ProcessorConfig, registry: FormatRegistry) -> ProcessResult<Self> {
        let threads = config.worker_threads();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("lazy-region-{i}"))
            .build()
            .map_err(|e| {
                LazyRegionError::internal_panic(format!("failed to build worker pool: {e}"))
            })?;
        debug!(target: "lazy_region::engine", threads, "processor ready");
        let encoder = Box::new(ImageEncoder::from_config(&config));
        Ok(Self {
            config,
            registry,
            encoder,
            pool: Arc::new(pool),
        })
    }

    /// Replace the encoder. Output formats must still be in the registry.
    pub fn with_encoder(mut self, encoder: Box<dyn Encoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    /// Decode `bytes` with the in-process backends and process them.
    /// JPEG sources use DCT-scaled levels; everything else decodes once.
    pub fn process_source(
        &self,
        bytes: ByteSource,
        ops: &OperationList,
        sink: &mut dyn Write,
    ) -> ProcessResult<ProcessInfo> {
        let format = SourceFormat::detect(bytes.as_bytes())
            .ok_or_else(|| LazyRegionError::unsupported_source_format("unknown"))?;
        self.registry.check_source(format)?;
        let mut backend: Box<dyn DecoderBackend> = match format {
            SourceFormat::Jpeg => Box::new(JpegBackend::new(bytes)?),
            _ => Box::new(RasterBackend::new(bytes)?),
        };
        let result = self.process(backend.as_mut(), ops, sink);
        backend.dispose();
        result
    }

    /// Run one request against `backend`, writing the encoded output to
    /// `sink`.
    pub fn process(
        &self,
        backend: &mut dyn DecoderBackend,
        ops: &OperationList,
        sink: &mut dyn Write,
    ) -> ProcessResult<ProcessInfo> {
        let started = Instant::now();
        ops.validate()?;
        let mut options = self.encode_options(ops);
        self.check_output(&options)?;
        self.registry.check_source(backend.source_format())?;

        let levels = backend.levels()?;
        let Some(base) = levels.iter().find(|level| level.index == 0) else {
            return Err(LazyRegionError::source_decode_failed("backend reported no levels"));
        };
        self.check_limits(base.width, base.height)?;
        let full = base.size();

        if options.icc_profile.is_none() {
            options.icc_profile = backend.icc_profile().map(|data| IccProfile {
                name: "source".to_string(),
                data: Arc::new(data),
            });
        }

        if backend.source_format() == SourceFormat::Gif
            && options.format == OutputFormat::Gif
            && backend.frame_count()? > 1
        {
            return self.process_animation(backend, ops, &options, sink, started);
        }

        let orientation = backend.orientation();
        let crop = ops.crop().to_stored(full, orientation);
        let scale = ops.scale().to_stored(orientation);

        let selection = PyramidSelector::select(full, &levels, &crop, &scale);
        let level = levels
            .iter()
            .find(|level| level.index == selection.level_index)
            .unwrap_or(base);
        let plan = RegionReader::plan(full, level, selection.factor, &crop, &scale);
        let decoded = RegionReader::read(backend, &plan)?;

        let raster = Pipeline::new(&self.config).run(
            decoded.raster,
            ops,
            full,
            plan.total_factor,
            decoded.hints,
            orientation,
        )?;
        self.encoder.write(&raster, &options, sink)?;

        let info = ProcessInfo {
            level_index: plan.level_index,
            total_factor: plan.total_factor,
            region: plan.region,
            output_width: raster.width(),
            output_height: raster.height(),
            frames: 1,
        };
        debug!(
            target: "lazy_region::engine",
            level = info.level_index,
            factor = info.total_factor.factor(),
            width = info.output_width,
            height = info.output_height,
            format = options.format.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request processed"
        );
        Ok(info)
    }

    fn process_animation(
        &self,
        backend: &mut dyn DecoderBackend,
        ops: &OperationList,
        options: &EncodeOptions,
        sink: &mut dyn Write,
        started: Instant,
    ) -> ProcessResult<ProcessInfo> {
        let count = backend.frame_count()?;
        let frames = (0..count)
            .map(|index| backend.read_frame(index))
            .collect::<ProcessResult<Vec<SourceFrame>>>()?;

        let config = self.config.clone();
        let frame_ops = ops.clone();
        let processor = FrameProcessor::new(Arc::clone(&self.pool), self.config.frame_join_timeout);
        let processed = processor.process_frames(frames, move |_, frame: SourceFrame| {
            let (w, h) = frame.raster.dimensions();
            let raster = Pipeline::new(&config).run(
                frame.raster,
                &frame_ops,
                Dimension::from_u32(w, h),
                ReductionFactor::default(),
                ReaderHints::empty(),
                Orientation::Rotate0,
            )?;
            Ok(EncodedFrame {
                raster,
                delay_ms: frame.delay_ms,
            })
        })?;

        self.encoder.write_animation(&processed, options, sink)?;
        let (output_width, output_height) = processed
            .first()
            .map(|frame| frame.raster.dimensions())
            .unwrap_or_default();
        let (full_w, full_h) = backend.level_size(0)?;
        debug!(
            target: "lazy_region::engine",
            frames = count,
            width = output_width,
            height = output_height,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "animation processed"
        );
        Ok(ProcessInfo {
            level_index: 0,
            total_factor: ReductionFactor::default(),
            region: DecodeRegion::full(full_w, full_h),
            output_width,
            output_height,
            frames: count,
        })
    }

    /// The Encode op in force, or the configured defaults.
    fn encode_options(&self, ops: &OperationList) -> EncodeOptions {
        ops.encode().cloned().unwrap_or_else(|| {
            EncodeOptions::new(self.config.default_format)
                .with_quality(self.config.default_quality)
        })
    }

    fn check_output(&self, options: &EncodeOptions) -> ProcessResult<()> {
        self.registry.check_output(options.format)?;
        if !self.encoder.supports(options.format) {
            return Err(LazyRegionError::unsupported_output_format(options.format.name()));
        }
        Ok(())
    }

    fn check_limits(&self, width: u32, height: u32) -> ProcessResult<()> {
        if width > self.config.max_dimension || height > self.config.max_dimension {
            return Err(LazyRegionError::dimension_exceeds_limit(
                width.max(height),
                self.config.max_dimension,
            ));
        }
        let pixels = width as u64 * height as u64;
        if pixels > self.config.max_pixels {
            return Err(LazyRegionError::pixel_count_exceeds_limit(
                pixels,
                self.config.max_pixels,
            ));
        }
        Ok(())
    }
}
