//! Byte counting for response bodies

use std::time::Instant;

/// Counts body bytes and the time spent receiving them
///
/// The clock starts at the first chunk, so header latency is not part of the
/// throughput figure.
#[derive(Debug, Default)]
pub struct ByteCounter {
    bytes: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one chunk
    pub fn record(&mut self, chunk: &[u8]) {
        let now = Instant::now();
        self.started.get_or_insert(now);
        self.finished = Some(now);
        self.bytes += chunk.len() as u64;
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Elapsed milliseconds, never less than 1
    pub fn elapsed_ms(&self) -> f64 {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => (end.duration_since(start).as_secs_f64() * 1000.0).max(1.0),
            _ => 1.0,
        }
    }

    /// Throughput in bytes per millisecond; always finite
    pub fn bytes_per_ms(&self) -> f64 {
        self.bytes as f64 / self.elapsed_ms()
    }
}
