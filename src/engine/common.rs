// src/engine/common.rs
//
// Common utilities shared across engine modules.
// Provides the engine result alias and the panic policy for native codec calls.

use crate::error::LazyRegionError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

pub type EngineResult<T> = std::result::Result<T, LazyRegionError>;

/// Run `f`, converting a panic inside it into `InternalPanic`.
///
/// Native codecs (libjpeg through mozjpeg, libwebp) signal some failures by
/// unwinding; a panic here must fail the request, not the worker thread.
pub fn run_with_panic_policy<T, F>(stage: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(target: "lazy_region::engine", stage, message = %message, "panic in codec stage");
            Err(LazyRegionError::internal_panic(format!("{stage}: {message}")))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passes_through_results() {
        assert_eq!(run_with_panic_policy("ok", || Ok(3)).unwrap(), 3);
        let err = run_with_panic_policy::<(), _>("err", || {
            Err(LazyRegionError::source_decode_failed("bad"))
        })
        .unwrap_err();
        assert!(matches!(err, LazyRegionError::DecodeFailed { .. }));
    }

    #[test]
    fn test_panic_becomes_internal_panic() {
        let err = run_with_panic_policy::<(), _>("decode:test", || panic!("boom")).unwrap_err();
        match err {
            LazyRegionError::InternalPanic { message } => {
                assert!(message.contains("decode:test"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
