// src/engine/io.rs
//
// I/O operations: the seekable ByteSource handed to decoders, file mapping,
// and ICC profile extraction.

use crate::error::LazyRegionError;
use img_parts::{jpeg::Jpeg, png::Png, webp::WebP, ImageICC};
use memmap2::Mmap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;

type IoResult<T> = std::result::Result<T, LazyRegionError>;

/// Retrieved source bytes with random access.
#[derive(Clone, Debug)]
pub enum ByteSource {
    /// In-memory data (streamed sources)
    Memory(Arc<Vec<u8>>),
    /// Memory-mapped file (cached sources, zero-copy access)
    Mapped(Arc<Mmap>),
    /// Memory-mapped temporary file, deleted when the last clone drops
    Temp(Arc<TempSource>),
}

/// A mapped temporary file. Field order matters: the mapping is released
/// before the path is removed.
#[derive(Debug)]
pub struct TempSource {
    map: Option<Mmap>,
    path: TempPath,
}

impl TempSource {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource {
    pub fn from_vec(data: Vec<u8>) -> Self {
        ByteSource::Memory(Arc::new(data))
    }

    /// Map a file read-only.
    pub fn map_file(path: &Path) -> IoResult<Self> {
        let display = path.to_string_lossy().to_string();
        let file =
            File::open(path).map_err(|e| LazyRegionError::file_read_failed(display.clone(), e))?;
        match map(&file, &display)? {
            Some(mmap) => Ok(ByteSource::Mapped(Arc::new(mmap))),
            None => Ok(ByteSource::from_vec(Vec::new())),
        }
    }

    /// Map a temporary file and take over its deletion.
    pub fn from_temp_path(path: TempPath) -> IoResult<Self> {
        let display = path.to_string_lossy().to_string();
        let file = File::open(&path)
            .map_err(|e| LazyRegionError::file_read_failed(display.clone(), e))?;
        let map = map(&file, &display)?;
        Ok(ByteSource::Temp(Arc::new(TempSource { map, path })))
    }

    /// Get the bytes directly - works for every variant without copying.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ByteSource::Memory(data) => data.as_slice(),
            ByteSource::Mapped(mmap) => mmap.as_ref(),
            ByteSource::Temp(temp) => temp.map.as_deref().unwrap_or(&[]),
        }
    }

    pub fn cursor(&self) -> Cursor<&[u8]> {
        Cursor::new(self.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing temporary file, if any.
    pub fn temp_path(&self) -> Option<&Path> {
        match self {
            ByteSource::Temp(temp) => Some(temp.path()),
            _ => None,
        }
    }
}

fn map(file: &File, display: &str) -> IoResult<Option<Mmap>> {
    let len = file
        .metadata()
        .map_err(|e| LazyRegionError::file_read_failed(display.to_string(), e))?
        .len();
    // Zero-length mappings are rejected on some platforms.
    if len == 0 {
        return Ok(None);
    }
    // Safety: cache and temp files are written once and persisted atomically;
    // nothing rewrites them while a mapping is alive.
    let mmap = unsafe { Mmap::map(file) }
        .map_err(|e| LazyRegionError::mmap_failed(display.to_string(), e))?;
    Ok(Some(mmap))
}

/// Extract ICC profile from image data.
/// Supports JPEG (APP2 marker), PNG (iCCP chunk), and WebP (ICCP chunk).
pub fn extract_icc_profile(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 12 {
        return None;
    }

    let icc_data = if data[0] == 0xFF && data[1] == 0xD8 {
        Jpeg::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec())?
    } else if data[..4] == [0x89, 0x50, 0x4E, 0x47] {
        Png::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec())?
    } else if &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        WebP::from_bytes(data.to_vec().into())
            .ok()?
            .icc_profile()
            .map(|icc| icc.to_vec())?
    } else {
        return None;
    };

    if validate_icc_profile(&icc_data) {
        Some(icc_data)
    } else {
        None
    }
}

/// Validate an ICC profile header (128 bytes with a matching size field and
/// ASCII signatures).
pub(crate) fn validate_icc_profile(icc_data: &[u8]) -> bool {
    if icc_data.len() < 128 {
        return false;
    }

    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }

    let ascii = |range: std::ops::Range<usize>| {
        icc_data[range]
            .iter()
            .all(|&b| (32..=126).contains(&b) || b == 0)
    };

    // CMM type, profile class, data color space, PCS
    if !(ascii(4..8) && ascii(12..16) && ascii(16..20) && ascii(20..24)) {
        return false;
    }

    // Major version is 2, 4 or 5 in practice
    icc_data[8] <= 10
}
