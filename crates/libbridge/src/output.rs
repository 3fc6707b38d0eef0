use std::sync::{Arc, Mutex, MutexGuard};

use bridge_protocol::{OutputLine, StreamName};

/// Output ceiling for the terminal result, in characters.
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 50_000;

/// Appended after truncated output.
pub const TRUNCATION_MARKER: &str = "\n...[truncated]";

/// Everything captured from a child so far.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    /// Raw lines, newline included, in arrival order.
    full: Vec<String>,
    /// Lines captured since the last flush.
    pending: Vec<OutputLine>,
}

impl CaptureBuffer {
    pub fn push(&mut self, raw: String, stream: StreamName) {
        let content = raw.strip_suffix('\n').unwrap_or(&raw);
        let content = content.strip_suffix('\r').unwrap_or(content);
        self.pending.push(OutputLine::new(content, stream));
        self.full.push(raw);
    }

    /// Take the pending queue, leaving it empty.
    pub fn drain_pending(&mut self) -> Vec<OutputLine> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.full.len()
    }

    /// Full output joined in arrival order.
    pub fn concat(&self) -> String {
        self.full.concat()
    }
}

/// Buffer shared between the two reader tasks and the coordinator.
#[derive(Debug, Clone, Default)]
pub struct SharedCapture(Arc<Mutex<CaptureBuffer>>);

impl SharedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, CaptureBuffer> {
        // A reader that panicked mid-push leaves the buffer usable.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, raw: String, stream: StreamName) {
        self.lock().push(raw, stream);
    }

    pub fn drain_pending(&self) -> Vec<OutputLine> {
        self.lock().drain_pending()
    }

    pub fn concat(&self) -> String {
        self.lock().concat()
    }
}

/// Cut `output` to `max_chars` characters and append the marker when it is
/// longer than that.
pub fn truncate_output(output: String, max_chars: usize) -> String {
    let cut = output.char_indices().nth(max_chars).map(|(idx, _)| idx);
    match cut {
        Some(byte_idx) => {
            let mut truncated = output;
            truncated.truncate(byte_idx);
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => output,
    }
}
