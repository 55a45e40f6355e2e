//! Streaming line framer
//!
//! Raw reads from a channel rarely align with sentence boundaries. The
//! framer buffers bytes and hands out complete lines, with the trailing
//! `\r\n` (or bare `\n`) stripped.

/// Longest partial line kept before it is emitted unterminated
pub const DEFAULT_MAX_LINE_LEN: usize = 256;

/// Buffers input and emits a line whenever a newline is encountered
#[derive(Debug, Clone)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line_len: usize,
}

impl LineFramer {
    /// Create a framer with the default line length limit
    pub fn new() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }

    /// Create a framer that force-emits partial lines longer than `max_line_len`
    ///
    /// Without a limit a channel that never sends `\n` would grow the
    /// buffer forever.
    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(max_line_len.min(1024)),
            max_line_len: max_line_len.max(1),
        }
    }

    /// Push raw bytes into the framer's buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete line from the buffer
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Some(line);
        }

        if self.buffer.len() > self.max_line_len {
            tracing::trace!(
                "Emitting {} unterminated bytes as a line",
                self.max_line_len
            );
            return Some(self.buffer.drain(..self.max_line_len).collect());
        }

        None
    }

    /// Number of buffered bytes not yet emitted
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
