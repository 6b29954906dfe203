//! Read latency over a doubling I/O size sweep.

use std::fmt;
use std::time::{Duration, Instant};

use crate::driver::Driver;
use crate::error::Result;

/// Smallest I/O size of a sweep.
pub const MIN_IO_SIZE: usize = 512;

/// Timing of one I/O size bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSample {
    pub io_size: usize,
    pub ios: usize,
    pub elapsed: Duration,
}

impl SweepSample {
    pub fn average_latency(&self) -> Duration {
        match u32::try_from(self.ios) {
            Ok(0) => Duration::ZERO,
            Ok(ios) => self.elapsed / ios,
            Err(_) => Duration::from_secs_f64(self.elapsed.as_secs_f64() / self.ios as f64),
        }
    }
}

impl fmt::Display for SweepSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>9} {:>14.2} {:>11.3}",
            self.io_size,
            self.average_latency().as_secs_f64() * 1e6,
            self.elapsed.as_secs_f64()
        )
    }
}

/// I/O sizes from [`MIN_IO_SIZE`] (or one block, if larger) doubling up to `max`.
pub fn sweep_sizes(block_size: usize, max: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = MIN_IO_SIZE.max(block_size);
    while size <= max {
        sizes.push(size);
        size *= 2;
    }
    sizes
}

/// Issue `ios_per_size` sequential reads for each size up to the controller's
/// maximum transfer, timing each bucket.
///
/// Offsets advance by the I/O size and wrap before running past the end of
/// the namespace.
pub fn latency_sweep(driver: &Driver, ios_per_size: usize) -> Result<Vec<SweepSample>> {
    let info = driver.controller();
    let block_size = info.namespace.block_size as usize;
    let max = info.max_transfer_bytes;
    let namespace_bytes = info.namespace_bytes();

    let mut buffer = driver.allocate(max)?;
    let mut run = || -> Result<Vec<SweepSample>> {
        let mut samples = Vec::new();
        for io_size in sweep_sizes(block_size, max) {
            let last_offset = namespace_bytes.saturating_sub(io_size as u64);
            let mut offset = 0;
            let start = Instant::now();
            for _ in 0..ios_per_size {
                driver.read(&mut buffer, offset, io_size)?;
                offset += io_size as u64;
                if offset > last_offset {
                    offset = 0;
                }
            }
            let sample = SweepSample {
                io_size,
                ios: ios_per_size,
                elapsed: start.elapsed(),
            };
            tracing::debug!(
                io_size,
                avg_us = sample.average_latency().as_secs_f64() * 1e6,
                "sweep bucket done"
            );
            samples.push(sample);
        }
        Ok(samples)
    };
    let samples = run();
    let freed = driver.free(buffer);
    if let (Err(_), Err(e)) = (&samples, &freed) {
        tracing::debug!(error = %e, "sweep buffer released once its command drains");
    }
    let samples = samples?;
    freed?;
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_double_up_to_max() {
        assert_eq!(sweep_sizes(512, 4096), vec![512, 1024, 2048, 4096]);
        assert_eq!(sweep_sizes(4096, 16384), vec![4096, 8192, 16384]);
        assert_eq!(sweep_sizes(512, 511), Vec::<usize>::new());
    }

    #[test]
    fn average_latency_divides_elapsed() {
        let sample = SweepSample {
            io_size: 512,
            ios: 4,
            elapsed: Duration::from_micros(100),
        };
        assert_eq!(sample.average_latency(), Duration::from_micros(25));
        let empty = SweepSample { ios: 0, ..sample };
        assert_eq!(empty.average_latency(), Duration::ZERO);
    }
}
