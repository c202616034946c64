// src/engine/retrieval.rs
//
// Source retrieval strategies.
//
// A retrieval turns an identifier into a seekable ByteSource. Streaming
// reads straight into memory; cache downloads persist into a shared cache
// directory with at most one in-flight download per identifier; temp-file
// downloads land in a private file removed when the ByteSource drops.

use crate::engine::io::ByteSource;
use crate::error::LazyRegionError;
use parking_lot::{Condvar, Mutex};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::NamedTempFile;
use tracing::{debug, error};

type RetrievalResult<T> = std::result::Result<T, LazyRegionError>;

/// A cache download is attempted at most this many times.
pub const MAX_RETRIEVAL_ATTEMPTS: u32 = 2;

/// Where source bytes come from.
pub trait StreamSource: Send + Sync {
    fn open(&self, identifier: &str) -> RetrievalResult<Box<dyn Read + Send>>;
}

/// Resolves identifiers as paths relative to a root directory.
#[derive(Clone, Debug)]
pub struct FileStreamSource {
    root: PathBuf,
}

impl FileStreamSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl StreamSource for FileStreamSource {
    fn open(&self, identifier: &str) -> RetrievalResult<Box<dyn Read + Send>> {
        if identifier.split(['/', '\\']).any(|part| part == "..") {
            return Err(LazyRegionError::invalid_argument(
                "identifier",
                identifier.to_string(),
                "must not escape the source root",
            ));
        }
        let path = self.root.join(identifier);
        let file = File::open(&path)
            .map_err(|e| LazyRegionError::file_read_failed(path.display().to_string(), e))?;
        Ok(Box::new(file))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetrievalStrategy {
    /// Read the stream into memory; nothing is shared between requests.
    Stream,
    /// Download into `cache_dir` once and map the cached file afterwards.
    CacheDownload { cache_dir: PathBuf },
    /// Download into a private temporary file under `dir`.
    TempFile { dir: PathBuf },
}

/// Identifiers with a download in flight.
#[derive(Default)]
pub struct DownloadRegistry {
    in_flight: Mutex<HashSet<String>>,
    finished: Condvar,
}

/// Marks an identifier as downloading until dropped.
pub struct DownloadGuard<'r> {
    registry: &'r DownloadRegistry,
    identifier: String,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identifier`, waiting while another caller holds it.
    pub fn acquire(&self, identifier: &str) -> DownloadGuard<'_> {
        let mut in_flight = self.in_flight.lock();
        while in_flight.contains(identifier) {
            self.finished.wait(&mut in_flight);
        }
        in_flight.insert(identifier.to_string());
        DownloadGuard {
            registry: self,
            identifier: identifier.to_string(),
        }
    }

    pub fn is_downloading(&self, identifier: &str) -> bool {
        self.in_flight.lock().contains(identifier)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl Drop for DownloadGuard<'_> {
    fn drop(&mut self) {
        self.registry.in_flight.lock().remove(&self.identifier);
        self.registry.finished.notify_all();
    }
}

pub struct Retriever {
    source: Arc<dyn StreamSource>,
    strategy: RetrievalStrategy,
    registry: Arc<DownloadRegistry>,
}

impl Retriever {
    pub fn new(source: Arc<dyn StreamSource>, strategy: RetrievalStrategy) -> Self {
        Self::with_registry(source, strategy, Arc::new(DownloadRegistry::new()))
    }

    /// Share a registry with other retrievers writing the same cache.
    pub fn with_registry(
        source: Arc<dyn StreamSource>,
        strategy: RetrievalStrategy,
        registry: Arc<DownloadRegistry>,
    ) -> Self {
        Self {
            source,
            strategy,
            registry,
        }
    }

    pub fn strategy(&self) -> &RetrievalStrategy {
        &self.strategy
    }

    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    pub fn retrieve(&self, identifier: &str) -> RetrievalResult<ByteSource> {
        let started = Instant::now();
        let source = match &self.strategy {
            RetrievalStrategy::Stream => self.stream(identifier)?,
            RetrievalStrategy::CacheDownload { cache_dir } => {
                self.cache_download(identifier, cache_dir)?
            }
            RetrievalStrategy::TempFile { dir } => self.temp_download(identifier, dir)?,
        };
        debug!(
            target: "lazy_region::retrieval",
            identifier,
            bytes = source.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieved source"
        );
        Ok(source)
    }

    fn stream(&self, identifier: &str) -> RetrievalResult<ByteSource> {
        let mut reader = self.source.open(identifier)?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| LazyRegionError::file_read_failed(identifier.to_string(), e))?;
        Ok(ByteSource::from_vec(data))
    }

    fn cache_download(&self, identifier: &str, cache_dir: &Path) -> RetrievalResult<ByteSource> {
        let path = cache_path(cache_dir, identifier);
        if path.is_file() {
            return ByteSource::map_file(&path);
        }

        let _guard = self.registry.acquire(identifier);
        // Another caller may have finished the download while we waited.
        if path.is_file() {
            debug!(target: "lazy_region::retrieval", identifier, "cache filled by concurrent download");
            return ByteSource::map_file(&path);
        }

        let mut last_error = None;
        for attempt in 1..=MAX_RETRIEVAL_ATTEMPTS {
            match self.download_to_cache(identifier, cache_dir, &path) {
                Ok(()) => return ByteSource::map_file(&path),
                Err(e) => {
                    error!(
                        target: "lazy_region::retrieval",
                        identifier,
                        attempt,
                        max_attempts = MAX_RETRIEVAL_ATTEMPTS,
                        error = %e,
                        "download attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        let message = last_error.map_or_else(|| "no attempts made".to_string(), |e| e.to_string());
        Err(LazyRegionError::retrieval_exhausted(
            identifier.to_string(),
            MAX_RETRIEVAL_ATTEMPTS,
            message,
        ))
    }

    /// Copy the stream into a temporary file beside the cache entry, then
    /// rename it into place so readers never see a partial file.
    fn download_to_cache(
        &self,
        identifier: &str,
        cache_dir: &Path,
        path: &Path,
    ) -> RetrievalResult<()> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            LazyRegionError::file_write_failed(cache_dir.display().to_string(), e)
        })?;
        let mut reader = self.source.open(identifier)?;
        let mut temp = NamedTempFile::new_in(cache_dir).map_err(|e| {
            LazyRegionError::file_write_failed(cache_dir.display().to_string(), e)
        })?;
        io::copy(&mut reader, temp.as_file_mut())
            .map_err(|e| LazyRegionError::file_write_failed(temp.path().display().to_string(), e))?;
        temp.persist(path).map_err(|e| {
            LazyRegionError::file_write_failed(path.display().to_string(), e.error)
        })?;
        Ok(())
    }

    fn temp_download(&self, identifier: &str, dir: &Path) -> RetrievalResult<ByteSource> {
        let mut reader = self.source.open(identifier)?;
        let mut temp = NamedTempFile::new_in(dir)
            .map_err(|e| LazyRegionError::file_write_failed(dir.display().to_string(), e))?;
        io::copy(&mut reader, temp.as_file_mut())
            .map_err(|e| LazyRegionError::file_write_failed(temp.path().display().to_string(), e))?;
        ByteSource::from_temp_path(temp.into_temp_path())
    }
}

/// Cache file for an identifier, named by the SHA-256 of the identifier so
/// the name stays 64 hex characters whatever the identifier length.
pub fn cache_path(cache_dir: &Path, identifier: &str) -> PathBuf {
    let digest = Sha256::digest(identifier.as_bytes());
    cache_dir.join(format!("{:x}", digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Serves fixed bytes, counting opens and failing the first `failures`.
    struct CountingSource {
        data: Vec<u8>,
        opens: AtomicU32,
        failures: u32,
        delay: Duration,
    }

    impl CountingSource {
        fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                opens: AtomicU32::new(0),
                failures: 0,
                delay: Duration::ZERO,
            }
        }

        fn failing(data: &[u8], failures: u32) -> Self {
            Self {
                failures,
                ..Self::new(data)
            }
        }

        fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl StreamSource for CountingSource {
        fn open(&self, identifier: &str) -> RetrievalResult<Box<dyn Read + Send>> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(self.delay);
            if n <= self.failures {
                return Err(LazyRegionError::file_read_failed(
                    identifier.to_string(),
                    io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"),
                ));
            }
            Ok(Box::new(Cursor::new(self.data.clone())))
        }
    }

    mod strategy_tests {
        use super::*;

        #[test]
        fn test_stream_reads_into_memory() {
            let source = Arc::new(CountingSource::new(b"pixels"));
            let retriever = Retriever::new(source.clone(), RetrievalStrategy::Stream);
            let bytes = retriever.retrieve("a.png").unwrap();
            assert!(matches!(bytes, ByteSource::Memory(_)));
            assert_eq!(bytes.as_bytes(), b"pixels");
            retriever.retrieve("a.png").unwrap();
            assert_eq!(source.opens(), 2);
        }

        #[test]
        fn test_cache_download_reuses_file() {
            let dir = tempfile::tempdir().unwrap();
            let source = Arc::new(CountingSource::new(b"cached bytes"));
            let retriever = Retriever::new(
                source.clone(),
                RetrievalStrategy::CacheDownload {
                    cache_dir: dir.path().to_path_buf(),
                },
            );
            let first = retriever.retrieve("img/1.jp2").unwrap();
            let second = retriever.retrieve("img/1.jp2").unwrap();
            assert_eq!(first.as_bytes(), b"cached bytes");
            assert_eq!(second.as_bytes(), b"cached bytes");
            assert!(matches!(second, ByteSource::Mapped(_)));
            assert_eq!(source.opens(), 1);
            assert!(cache_path(dir.path(), "img/1.jp2").is_file());
        }

        #[test]
        fn test_long_identifier_fits_file_name_limit() {
            let dir = tempfile::tempdir().unwrap();
            let identifier = format!("https://tiles.example.org/{}/full.jp2", "a".repeat(400));
            let path = cache_path(dir.path(), &identifier);
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert_eq!(name.len(), 64); // SHA-256 hex is 64 chars
            assert_ne!(path, cache_path(dir.path(), "img/1.jp2"));

            let source = Arc::new(CountingSource::new(b"long name"));
            let retriever = Retriever::new(
                source.clone(),
                RetrievalStrategy::CacheDownload {
                    cache_dir: dir.path().to_path_buf(),
                },
            );
            assert_eq!(retriever.retrieve(&identifier).unwrap().as_bytes(), b"long name");
            assert!(path.is_file());
        }

        #[test]
        fn test_cache_download_retries_once() {
            let dir = tempfile::tempdir().unwrap();
            let source = Arc::new(CountingSource::failing(b"ok", 1));
            let retriever = Retriever::new(
                source.clone(),
                RetrievalStrategy::CacheDownload {
                    cache_dir: dir.path().to_path_buf(),
                },
            );
            assert_eq!(retriever.retrieve("x").unwrap().as_bytes(), b"ok");
            assert_eq!(source.opens(), 2);
        }

        #[test]
        fn test_second_failure_is_exhausted() {
            let dir = tempfile::tempdir().unwrap();
            let source = Arc::new(CountingSource::failing(b"never", 5));
            let retriever = Retriever::new(
                source.clone(),
                RetrievalStrategy::CacheDownload {
                    cache_dir: dir.path().to_path_buf(),
                },
            );
            let err = retriever.retrieve("x").unwrap_err();
            match err {
                LazyRegionError::RetrievalExhausted { attempts, message, .. } => {
                    assert_eq!(attempts, MAX_RETRIEVAL_ATTEMPTS);
                    assert!(message.contains("reset by peer"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
            assert_eq!(source.opens(), MAX_RETRIEVAL_ATTEMPTS);
            assert!(!cache_path(dir.path(), "x").exists());
            assert_eq!(retriever.registry().in_flight(), 0);
        }

        #[test]
        fn test_temp_file_removed_on_drop() {
            let dir = tempfile::tempdir().unwrap();
            let retriever = Retriever::new(
                Arc::new(CountingSource::new(b"temporary")),
                RetrievalStrategy::TempFile {
                    dir: dir.path().to_path_buf(),
                },
            );
            let bytes = retriever.retrieve("t").unwrap();
            let path = bytes.temp_path().unwrap().to_path_buf();
            assert!(path.exists());
            assert_eq!(bytes.as_bytes(), b"temporary");
            drop(bytes);
            assert!(!path.exists());
        }

        #[test]
        fn test_file_source_rejects_parent_escape() {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("a.bin"), b"abc").unwrap();
            let source = FileStreamSource::new(dir.path());
            let mut data = Vec::new();
            source.open("a.bin").unwrap().read_to_end(&mut data).unwrap();
            assert_eq!(data, b"abc");
            assert!(matches!(
                source.open("../etc/passwd"),
                Err(LazyRegionError::InvalidArgument { .. })
            ));
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_guard_releases_identifier() {
            let registry = DownloadRegistry::new();
            {
                let _guard = registry.acquire("a");
                assert!(registry.is_downloading("a"));
                assert!(!registry.is_downloading("b"));
            }
            assert_eq!(registry.in_flight(), 0);
        }

        #[test]
        fn test_concurrent_downloads_fetch_once() {
            let dir = tempfile::tempdir().unwrap();
            let source = Arc::new(CountingSource {
                delay: Duration::from_millis(50),
                ..CountingSource::new(b"shared")
            });
            let retriever = Arc::new(Retriever::new(
                source.clone(),
                RetrievalStrategy::CacheDownload {
                    cache_dir: dir.path().to_path_buf(),
                },
            ));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let retriever = Arc::clone(&retriever);
                    std::thread::spawn(move || retriever.retrieve("same-id"))
                })
                .collect();
            for handle in handles {
                assert_eq!(handle.join().unwrap().unwrap().as_bytes(), b"shared");
            }
            assert_eq!(source.opens(), 1);
        }
    }
}
