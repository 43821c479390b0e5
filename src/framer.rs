//! Newline-delimited framing for the worker's stdout
//!
//! Output arrives in arbitrary chunks. The framer buffers partial lines and
//! yields each complete, non-blank line with surrounding whitespace trimmed.

use tracing::warn;

/// Lines longer than this are discarded instead of growing the buffer forever
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_bytes: usize,
    /// Set while skipping the rest of an oversized line
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Feed a chunk and collect every message it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut messages = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }

            self.buffer.extend_from_slice(line);
            if let Some(message) = self.take_line() {
                messages.push(message);
            }
        }

        if !self.discarding {
            self.buffer.extend_from_slice(rest);
            if self.buffer.len() > self.max_line_bytes {
                warn!(
                    buffered = self.buffer.len(),
                    limit = self.max_line_bytes,
                    "Discarding oversized worker output line"
                );
                self.buffer.clear();
                self.discarding = true;
            }
        }

        messages
    }

    /// Bytes of an incomplete trailing line
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn take_line(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&raw);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}
