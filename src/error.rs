// src/error.rs
//
// Unified error handling for lazy-region
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - UserError: Invalid operation lists or arguments, recoverable
// - CodecError: Source/output format and backend issues
// - ResourceLimit: Memory/time/dimension limits and I/O exhaustion
// - InternalBug: Library bugs (should not happen)
//
// Every kind is fatal for the current request except MetadataReadFailed,
// which callers log and continue past.

use std::borrow::Cow;
use thiserror::Error;

/// Error taxonomy used to route failures at the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Invalid input, recoverable by the caller
    UserError,
    /// Format/codec/backend issues
    CodecError,
    /// Memory/time/dimension limits, exhausted retries
    ResourceLimit,
    /// Library bugs (should not happen)
    InternalBug,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::UserError => "UserError",
            ErrorCategory::CodecError => "CodecError",
            ErrorCategory::ResourceLimit => "ResourceLimit",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

/// lazy-region error types
#[derive(Debug, Error)]
pub enum LazyRegionError {
    // Format Errors (checked before any decode work)
    #[error("Unsupported source format: {format}")]
    UnsupportedSourceFormat { format: Cow<'static, str> },

    #[error("Unsupported output format: {format}")]
    UnsupportedOutputFormat { format: Cow<'static, str> },

    // Decode Errors
    #[error("Failed to decode level {level} region {region}: {message}")]
    DecodeFailed {
        level: u32,
        region: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Failed to read {what} metadata: {message}")]
    MetadataReadFailed {
        what: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Backend process '{program}' exited with status {status}: {stderr}")]
    BackendProcessFailed {
        program: Cow<'static, str>,
        status: i32,
        stderr: Cow<'static, str>,
    },

    // Retrieval / concurrency Errors
    #[error("Retrieval of '{identifier}' failed after {attempts} attempts: {message}")]
    RetrievalExhausted {
        identifier: Cow<'static, str>,
        attempts: u32,
        message: Cow<'static, str>,
    },

    #[error("Timed out after {timeout_ms}ms waiting for {pending} of {frames} frames")]
    FrameJoinTimeout {
        timeout_ms: u64,
        pending: usize,
        frames: usize,
    },

    // File I/O Errors
    #[error("Failed to read file '{path}': {source}")]
    FileReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWriteFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to memory-map file '{path}': {source}")]
    MmapFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    // Size Limit Errors
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    // Operation Errors
    #[error("Invalid {operation} operation: {reason}")]
    InvalidOperation {
        operation: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Resize failed ({source_width}x{source_height} -> {target_width}x{target_height}): {message}")]
    ResizeFailed {
        source_width: u32,
        source_height: u32,
        target_width: u32,
        target_height: u32,
        message: Cow<'static, str>,
    },

    // Encode Errors
    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Configuration Errors
    #[error("Invalid value for {name}: {value}. {reason}")]
    InvalidArgument {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    // Internal Errors
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },
}

fn clone_io(source: &std::io::Error) -> std::io::Error {
    std::io::Error::new(source.kind(), source.to_string())
}

impl Clone for LazyRegionError {
    fn clone(&self) -> Self {
        match self {
            Self::UnsupportedSourceFormat { format } => Self::UnsupportedSourceFormat {
                format: format.clone(),
            },
            Self::UnsupportedOutputFormat { format } => Self::UnsupportedOutputFormat {
                format: format.clone(),
            },
            Self::DecodeFailed {
                level,
                region,
                message,
            } => Self::DecodeFailed {
                level: *level,
                region: region.clone(),
                message: message.clone(),
            },
            Self::MetadataReadFailed { what, message } => Self::MetadataReadFailed {
                what: what.clone(),
                message: message.clone(),
            },
            Self::BackendProcessFailed {
                program,
                status,
                stderr,
            } => Self::BackendProcessFailed {
                program: program.clone(),
                status: *status,
                stderr: stderr.clone(),
            },
            Self::RetrievalExhausted {
                identifier,
                attempts,
                message,
            } => Self::RetrievalExhausted {
                identifier: identifier.clone(),
                attempts: *attempts,
                message: message.clone(),
            },
            Self::FrameJoinTimeout {
                timeout_ms,
                pending,
                frames,
            } => Self::FrameJoinTimeout {
                timeout_ms: *timeout_ms,
                pending: *pending,
                frames: *frames,
            },
            Self::FileReadFailed { path, source } => Self::FileReadFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::FileWriteFailed { path, source } => Self::FileWriteFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::MmapFailed { path, source } => Self::MmapFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::DimensionExceedsLimit { dimension, max } => Self::DimensionExceedsLimit {
                dimension: *dimension,
                max: *max,
            },
            Self::PixelCountExceedsLimit { pixels, max } => Self::PixelCountExceedsLimit {
                pixels: *pixels,
                max: *max,
            },
            Self::InvalidOperation { operation, reason } => Self::InvalidOperation {
                operation: operation.clone(),
                reason: reason.clone(),
            },
            Self::ResizeFailed {
                source_width,
                source_height,
                target_width,
                target_height,
                message,
            } => Self::ResizeFailed {
                source_width: *source_width,
                source_height: *source_height,
                target_width: *target_width,
                target_height: *target_height,
                message: message.clone(),
            },
            Self::EncodeFailed { format, message } => Self::EncodeFailed {
                format: format.clone(),
                message: message.clone(),
            },
            Self::InvalidArgument {
                name,
                value,
                reason,
            } => Self::InvalidArgument {
                name: name.clone(),
                value: value.clone(),
                reason: reason.clone(),
            },
            Self::InternalPanic { message } => Self::InternalPanic {
                message: message.clone(),
            },
        }
    }
}

// Constructor Helpers
impl LazyRegionError {
    pub fn unsupported_source_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedSourceFormat {
            format: format.into(),
        }
    }

    pub fn unsupported_output_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedOutputFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(
        level: u32,
        region: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::DecodeFailed {
            level,
            region: region.into(),
            message: message.into(),
        }
    }

    /// Decode failure that happened before any level/region was known
    /// (header parsing, whole-image decode).
    pub fn source_decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::decode_failed(0, "full", message)
    }

    pub fn metadata_read_failed(
        what: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::MetadataReadFailed {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn backend_process_failed(
        program: impl Into<Cow<'static, str>>,
        status: i32,
        stderr: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::BackendProcessFailed {
            program: program.into(),
            status,
            stderr: stderr.into(),
        }
    }

    pub fn retrieval_exhausted(
        identifier: impl Into<Cow<'static, str>>,
        attempts: u32,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::RetrievalExhausted {
            identifier: identifier.into(),
            attempts,
            message: message.into(),
        }
    }

    pub fn frame_join_timeout(timeout_ms: u64, pending: usize, frames: usize) -> Self {
        Self::FrameJoinTimeout {
            timeout_ms,
            pending,
            frames,
        }
    }

    pub fn file_read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn file_write_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn mmap_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::MmapFailed {
            path: path.into(),
            source,
        }
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn invalid_operation(
        operation: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn resize_failed(
        source_dims: (u32, u32),
        target_dims: (u32, u32),
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::ResizeFailed {
            source_width: source_dims.0,
            source_height: source_dims.1,
            target_width: target_dims.0,
            target_height: target_dims.1,
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn invalid_argument(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (caller can fix it)
    ///
    /// Consistent with category():
    /// - UserError and ResourceLimit errors are recoverable
    /// - CodecError and InternalBug errors are not
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::UserError | ErrorCategory::ResourceLimit => true,
            ErrorCategory::CodecError | ErrorCategory::InternalBug => false,
        }
    }

    /// Whether this error aborts the request. Only metadata failures degrade
    /// gracefully.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MetadataReadFailed { .. })
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidOperation { .. } | Self::InvalidArgument { .. } => {
                ErrorCategory::UserError
            }

            Self::UnsupportedSourceFormat { .. }
            | Self::UnsupportedOutputFormat { .. }
            | Self::DecodeFailed { .. }
            | Self::MetadataReadFailed { .. }
            | Self::BackendProcessFailed { .. }
            | Self::EncodeFailed { .. }
            | Self::ResizeFailed { .. } => ErrorCategory::CodecError,

            Self::RetrievalExhausted { .. }
            | Self::FrameJoinTimeout { .. }
            | Self::FileReadFailed { .. }
            | Self::FileWriteFailed { .. }
            | Self::MmapFailed { .. }
            | Self::DimensionExceedsLimit { .. }
            | Self::PixelCountExceedsLimit { .. } => ErrorCategory::ResourceLimit,

            Self::InternalPanic { .. } => ErrorCategory::InternalBug,
        }
    }

    /// The I/O error kind this error surfaces as when handed to I/O-shaped
    /// callers. Join timeouts are I/O-class.
    pub fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            Self::FrameJoinTimeout { .. } => std::io::ErrorKind::TimedOut,
            Self::FileReadFailed { source, .. }
            | Self::FileWriteFailed { source, .. }
            | Self::MmapFailed { source, .. } => source.kind(),
            Self::RetrievalExhausted { .. } => std::io::ErrorKind::NotFound,
            Self::UnsupportedSourceFormat { .. }
            | Self::UnsupportedOutputFormat { .. }
            | Self::InvalidOperation { .. }
            | Self::InvalidArgument { .. } => std::io::ErrorKind::InvalidInput,
            Self::DecodeFailed { .. } | Self::MetadataReadFailed { .. } => {
                std::io::ErrorKind::InvalidData
            }
            _ => std::io::ErrorKind::Other,
        }
    }

    pub fn into_io_error(self) -> std::io::Error {
        std::io::Error::new(self.io_kind(), self)
    }
}

impl From<LazyRegionError> for std::io::Error {
    fn from(err: LazyRegionError) -> Self {
        err.into_io_error()
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, LazyRegionError>;
