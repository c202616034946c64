// src/engine/frames.rs
//
// Parallel processing of multi-frame sources.
//
// Frames are split into contiguous chunks, one rayon task per chunk. Each
// task owns its chunk's slot in the result table and fills it exactly once,
// so tasks never contend on results. The caller waits on a countdown latch
// bounded by the configured join timeout.

use crate::engine::common::run_with_panic_policy;
use crate::error::LazyRegionError;
use parking_lot::{Condvar, Mutex};
use rayon::ThreadPool;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, error};

type FrameResult<T> = std::result::Result<T, LazyRegionError>;

/// Counts outstanding tasks; waiters wake when it reaches zero.
pub struct CountdownLatch {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            done: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.done.notify_all();
        }
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.lock()
    }

    /// Wait until the count reaches zero. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            if self.done.wait_until(&mut remaining, deadline).timed_out() {
                return *remaining == 0;
            }
        }
        true
    }
}

/// Splits `n` items into `min(n, workers)` contiguous chunks whose lengths
/// differ by at most one. Returns `(start, len)` pairs.
pub fn partition(n: usize, workers: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    let tasks = n.min(workers.max(1));
    let base = n / tasks;
    let extra = n % tasks;
    let mut start = 0;
    (0..tasks)
        .map(|task| {
            let len = base + usize::from(task < extra);
            let chunk = (start, len);
            start += len;
            chunk
        })
        .collect()
}

pub struct FrameProcessor {
    pool: Arc<ThreadPool>,
    timeout: Duration,
}

impl FrameProcessor {
    pub fn new(pool: Arc<ThreadPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    /// Run `f(index, frame)` over every frame on the worker pool and return
    /// the results in frame order.
    ///
    /// The first frame error (in frame order) fails the whole call. If the
    /// pool does not finish within the join timeout the call fails with
    /// `FrameJoinTimeout`; tasks still running are abandoned.
    pub fn process_frames<T, R, F>(&self, frames: Vec<T>, f: F) -> FrameResult<Vec<R>>
    where
        T: Send + 'static,
        R: Send + Sync + 'static,
        F: Fn(usize, T) -> FrameResult<R> + Send + Sync + 'static,
    {
        let total = frames.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let chunks = partition(total, self.pool.current_num_threads());

        let slots: Arc<Vec<OnceLock<Vec<FrameResult<R>>>>> =
            Arc::new((0..chunks.len()).map(|_| OnceLock::new()).collect());
        let latch = Arc::new(CountdownLatch::new(chunks.len()));
        let f = Arc::new(f);

        let mut frames = frames.into_iter();
        for (slot, &(start, len)) in chunks.iter().enumerate() {
            let owned: Vec<T> = frames.by_ref().take(len).collect();
            let slots = Arc::clone(&slots);
            let latch = Arc::clone(&latch);
            let f = Arc::clone(&f);
            self.pool.spawn(move || {
                let results = owned
                    .into_iter()
                    .enumerate()
                    .map(|(offset, frame)| {
                        let index = start + offset;
                        run_with_panic_policy("frames:process", || f(index, frame))
                    })
                    .collect();
                // Each slot belongs to exactly one task.
                let _ = slots[slot].set(results);
                // Release the table before signalling so the joiner can take it.
                drop(slots);
                latch.count_down();
            });
        }

        if !latch.wait(self.timeout) {
            let pending: usize = chunks
                .iter()
                .zip(slots.iter())
                .filter(|(_, slot)| slot.get().is_none())
                .map(|(chunk, _)| chunk.1)
                .sum();
            error!(
                target: "lazy_region::frames",
                frames = total,
                pending_frames = pending,
                pending_tasks = latch.remaining(),
                timeout_ms = self.timeout.as_millis() as u64,
                "frame join timed out"
            );
            return Err(LazyRegionError::frame_join_timeout(
                self.timeout.as_millis() as u64,
                pending,
                total,
            ));
        }

        let slots = Arc::try_unwrap(slots).map_err(|_| {
            LazyRegionError::internal_panic("frame result table still shared after join")
        })?;
        let mut out = Vec::with_capacity(total);
        for slot in slots {
            let results = slot
                .into_inner()
                .ok_or_else(|| LazyRegionError::internal_panic("frame task left no result"))?;
            for result in results {
                out.push(result?);
            }
        }

        debug!(
            target: "lazy_region::frames",
            frames = total,
            tasks = chunks.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "processed frames"
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(threads: usize) -> Arc<ThreadPool> {
        Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap(),
        )
    }

    mod partition_tests {
        use super::*;

        #[test]
        fn test_even_split() {
            assert_eq!(partition(8, 4), vec![(0, 2), (2, 2), (4, 2), (6, 2)]);
        }

        #[test]
        fn test_uneven_split_covers_all() {
            let chunks = partition(10, 4);
            assert_eq!(chunks, vec![(0, 3), (3, 3), (6, 2), (8, 2)]);
            assert_eq!(chunks.iter().map(|c| c.1).sum::<usize>(), 10);
        }

        #[test]
        fn test_one_task_per_worker() {
            let chunks = partition(5, 4);
            assert_eq!(chunks, vec![(0, 2), (2, 1), (3, 1), (4, 1)]);
            for workers in 1..=9 {
                let chunks = partition(7, workers);
                assert_eq!(chunks.len(), 7.min(workers));
                let lens: Vec<usize> = chunks.iter().map(|c| c.1).collect();
                let spread = lens.iter().max().unwrap() - lens.iter().min().unwrap();
                assert!(spread <= 1, "uneven chunks {lens:?}");
            }
        }

        #[test]
        fn test_fewer_frames_than_workers() {
            assert_eq!(partition(2, 16), vec![(0, 1), (1, 1)]);
            assert!(partition(0, 4).is_empty());
        }
    }

    mod latch_tests {
        use super::*;

        #[test]
        fn test_latch_releases_at_zero() {
            let latch = Arc::new(CountdownLatch::new(2));
            let other = Arc::clone(&latch);
            let handle = std::thread::spawn(move || {
                other.count_down();
                other.count_down();
            });
            assert!(latch.wait(Duration::from_secs(5)));
            handle.join().unwrap();
            assert_eq!(latch.remaining(), 0);
        }

        #[test]
        fn test_latch_times_out() {
            let latch = CountdownLatch::new(1);
            assert!(!latch.wait(Duration::from_millis(20)));
        }
    }

    mod process_tests {
        use super::*;

        #[test]
        fn test_results_in_frame_order() {
            let processor = FrameProcessor::new(pool(3), Duration::from_secs(10));
            let frames: Vec<u32> = (0..11).collect();
            let out = processor
                .process_frames(frames, |index, frame| Ok((index, frame * 2)))
                .unwrap();
            assert_eq!(out.len(), 11);
            for (i, (index, doubled)) in out.into_iter().enumerate() {
                assert_eq!(index, i);
                assert_eq!(doubled, i as u32 * 2);
            }
        }

        #[test]
        fn test_every_frame_runs_once() {
            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            let processor = FrameProcessor::new(pool(4), Duration::from_secs(10));
            processor
                .process_frames(vec![(); 9], move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 9);
        }

        #[test]
        fn test_frame_error_fails_request() {
            let processor = FrameProcessor::new(pool(2), Duration::from_secs(10));
            let err = processor
                .process_frames(vec![0u8, 1, 2, 3], |index, _| {
                    if index == 2 {
                        Err(LazyRegionError::invalid_argument("frame", "2", "bad frame"))
                    } else {
                        Ok(index)
                    }
                })
                .unwrap_err();
            assert!(matches!(err, LazyRegionError::InvalidArgument { .. }));
        }

        #[test]
        fn test_panicking_frame_is_contained() {
            let processor = FrameProcessor::new(pool(2), Duration::from_secs(10));
            let err = processor
                .process_frames(vec![0u8, 1], |index, _| -> FrameResult<usize> {
                    if index == 1 {
                        panic!("frame exploded");
                    }
                    Ok(index)
                })
                .unwrap_err();
            assert!(matches!(err, LazyRegionError::InternalPanic { .. }));
        }

        #[test]
        fn test_join_timeout() {
            let processor = FrameProcessor::new(pool(1), Duration::from_millis(30));
            let err = processor
                .process_frames(vec![0u8], |_, _| {
                    std::thread::sleep(Duration::from_millis(500));
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, LazyRegionError::FrameJoinTimeout { .. }));
            assert_eq!(err.into_io_error().kind(), std::io::ErrorKind::TimedOut);
        }
    }
}
