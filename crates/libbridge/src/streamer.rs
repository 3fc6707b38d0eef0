use std::time::{Duration, Instant};

use bridge_protocol::OutputLine;
use tracing::{debug, warn};

use crate::control::OutputSink;
use crate::output::SharedCapture;

/// Minimum spacing between two streamed batches.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// How often the coordinator wakes to check for flushes and timeouts.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Forwards newly captured lines to an [`OutputSink`] at most once per flush
/// interval. Send failures are logged and dropped.
pub struct BatchStreamer<'a, S> {
    sink: &'a S,
    work_item_id: &'a str,
    flush_interval: Duration,
    last_flush: Instant,
    batches_sent: usize,
}

impl<'a, S: OutputSink> BatchStreamer<'a, S> {
    pub fn new(sink: &'a S, work_item_id: &'a str, flush_interval: Duration) -> Self {
        Self {
            sink,
            work_item_id,
            flush_interval,
            last_flush: Instant::now(),
            batches_sent: 0,
        }
    }

    /// Flush if a full interval has passed and something is pending.
    pub async fn tick(&mut self, capture: &SharedCapture) {
        if self.last_flush.elapsed() < self.flush_interval {
            return;
        }
        let lines = capture.drain_pending();
        if lines.is_empty() {
            return;
        }
        self.send(lines).await;
        self.last_flush = Instant::now();
    }

    /// Send whatever is left, regardless of the interval.
    pub async fn finish(&mut self, capture: &SharedCapture) {
        let lines = capture.drain_pending();
        if !lines.is_empty() {
            self.send(lines).await;
        }
        debug!(
            work_item_id = self.work_item_id,
            batches = self.batches_sent,
            "streaming finished"
        );
    }

    pub fn batches_sent(&self) -> usize {
        self.batches_sent
    }

    async fn send(&mut self, lines: Vec<OutputLine>) {
        let count = lines.len();
        match self.sink.send_batch(self.work_item_id, lines).await {
            Ok(()) => {
                self.batches_sent += 1;
                debug!(work_item_id = self.work_item_id, lines = count, "batch streamed");
            }
            Err(e) => {
                warn!(
                    work_item_id = self.work_item_id,
                    lines = count,
                    error = %e,
                    "stream batch dropped"
                );
            }
        }
    }
}
