// lib.rs
//
// lazy-region: region-first image processing core.
//
// Design goals:
// - Decode only the pyramid level and region a request needs
// - Apply crop, scale, rotate, color, sharpen, redaction and overlays in one pass
// - Keep codecs behind backend/encoder traits
// - No global state: configuration, registry and worker pool are injected

pub mod engine;
pub mod error;
pub mod ops;

pub use engine::{
    ByteSource, DecoderBackend, FormatRegistry, ProcessInfo, Processor, ProcessorConfig, Raster,
    SourceFormat,
};
pub use error::{LazyRegionError, Result};
pub use ops::{Operation, OperationList};

use engine::decoder::{read_dimensions, read_exif_orientation};
use ops::Orientation;

/// Header facts about a source, read without decoding pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub format: SourceFormat,
    /// Rotation that displays the stored pixels upright
    pub orientation: Orientation,
}

/// Inspect a source's header.
///
/// Unreadable orientation metadata is not an error; the source is reported
/// as upright.
pub fn inspect(bytes: &[u8]) -> Result<SourceInfo> {
    let format = SourceFormat::detect(bytes)
        .ok_or_else(|| LazyRegionError::unsupported_source_format("unknown"))?;
    if format == SourceFormat::Jpeg2000 {
        return Err(LazyRegionError::unsupported_source_format(format.name()));
    }
    let (width, height) = read_dimensions(bytes)?;
    let orientation = read_exif_orientation(bytes)
        .ok()
        .flatten()
        .unwrap_or_default();
    Ok(SourceInfo {
        width,
        height,
        format,
        orientation,
    })
}

/// Inspect a file's header through a read-only mapping.
pub fn inspect_file(path: &std::path::Path) -> Result<SourceInfo> {
    let source = ByteSource::map_file(path)?;
    inspect(source.as_bytes())
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
