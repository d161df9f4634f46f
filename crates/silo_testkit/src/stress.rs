//! Stress tests for silos.
//!
//! These exercise a silo under concurrent inserts and lookups while the
//! aging thread evicts segments.

use crate::fixtures::sample_object;
use parking_lot::Mutex;
use silo_core::{ObjectHandle, Silo};
use std::thread;
use std::time::{Duration, Instant};

/// Outcome of a stress run.
#[derive(Debug, Clone, Copy)]
pub struct StressTestResult {
    /// Inserts that succeeded and lookups that returned the right payload
    /// or a clean miss.
    pub successful_ops: usize,
    /// Refused inserts and lookups that returned an error or a wrong payload.
    pub failed_ops: usize,
    /// Wall time of the run.
    pub duration: Duration,
}

impl StressTestResult {
    /// Returns every operation counted.
    #[must_use]
    pub const fn total_ops(&self) -> usize {
        self.successful_ops + self.failed_ops
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Payload size in bytes.
    pub object_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 4,
            object_size: 700,
        }
    }
}

/// Runs inserts from several threads, each reading back a random earlier
/// object after every insert.
///
/// A lookup may miss once its segment was evicted; a lookup that returns
/// the wrong payload counts as a failure.
pub fn stress_concurrent_mixed(silo: &Silo, config: &StressConfig) -> StressTestResult {
    let tally = Mutex::new((0usize, 0usize));
    let start = Instant::now();

    thread::scope(|s| {
        for t in 0..config.threads {
            let tally = &tally;
            s.spawn(move || {
                let tag = t as u8;
                let payload = vec![tag; config.object_size];
                let mut handles: Vec<ObjectHandle> = Vec::new();
                let (mut ok, mut bad) = (0, 0);
                for i in 0..config.operations {
                    match silo.insert(&sample_object(tag, &payload)) {
                        Ok(h) => {
                            handles.push(h);
                            ok += 1;
                        }
                        Err(_) => bad += 1,
                    }
                    let Some(&handle) = handles.get(i.wrapping_mul(7919) % handles.len().max(1))
                    else {
                        continue;
                    };
                    match silo.lookup(handle) {
                        Ok(Some(object)) if object.payload == payload => ok += 1,
                        Ok(None) => ok += 1,
                        _ => bad += 1,
                    }
                }
                let mut tally = tally.lock();
                tally.0 += ok;
                tally.1 += bad;
            });
        }
    });

    let (successful_ops, failed_ops) = tally.into_inner();
    StressTestResult {
        successful_ops,
        failed_ops,
        duration: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{small_config, TestSilo};

    #[test]
    fn concurrent_mixed_with_aging() {
        let config = small_config()
            .min_nseg(4)
            .max_nseg(64)
            .background_aging(true)
            .aging_interval(Duration::from_millis(5));
        let silo = TestSilo::memory_sized(2 * 1024 * 1024, config);
        let result = stress_concurrent_mixed(
            &silo,
            &StressConfig {
                operations: 300,
                threads: 4,
                object_size: 700,
            },
        );
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops(), 2 * 300 * 4);
        assert!(silo.segments().unwrap().len() <= 64);
        assert!(silo.stats().segments_evicted > 0);
    }
}
