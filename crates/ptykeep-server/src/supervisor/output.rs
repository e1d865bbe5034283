//! Bounded chunk buffer for captured PTY output.
//!
//! Stores the most recent N raw read chunks exactly as they came off the
//! PTY (escape sequences and partial frames included). Offsets are absolute
//! chunk sequence numbers, so a poller keeps a stable cursor even after the
//! oldest chunks have been discarded.

use std::collections::VecDeque;

/// A fixed-capacity buffer of output chunks, oldest discarded first.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
    /// Chunks discarded from the front since the session started.
    dropped: u64,
    /// Bytes currently retained.
    bytes: usize,
}

/// A contiguous window of captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSlice {
    /// Absolute offset of the first chunk in `chunks`.
    pub offset: u64,
    pub chunks: Vec<Vec<u8>>,
    /// Total chunks captured since start.
    pub total: u64,
}

impl OutputSlice {
    /// Offset a poller should pass next time.
    pub fn next_offset(&self) -> u64 {
        self.offset + self.chunks.len() as u64
    }

    /// All chunks joined into one byte vector.
    pub fn concat(&self) -> Vec<u8> {
        self.chunks.concat()
    }
}

impl OutputBuffer {
    /// Create a buffer that retains at most `capacity` chunks.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            dropped: 0,
            bytes: 0,
        }
    }

    /// Append one chunk, trimming the oldest entries past capacity.
    pub fn push(&mut self, chunk: Vec<u8>) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.chunks.len() > self.capacity {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
                self.dropped += 1;
            }
        }
    }

    /// Chunks from `offset`, at most `limit` of them (0 = to the end).
    pub fn slice(&self, offset: u64, limit: usize) -> OutputSlice {
        let total = self.total();
        let start = offset.max(self.dropped);
        if start >= total {
            return OutputSlice {
                offset: total,
                chunks: Vec::new(),
                total,
            };
        }
        let end = if limit == 0 {
            total
        } else {
            total.min(start.saturating_add(limit as u64))
        };
        let from = (start - self.dropped) as usize;
        let to = (end - self.dropped) as usize;
        OutputSlice {
            offset: start,
            chunks: self.chunks.range(from..to).cloned().collect(),
            total,
        }
    }

    /// Total chunks ever captured.
    pub fn total(&self) -> u64 {
        self.dropped + self.chunks.len() as u64
    }

    /// Chunks currently retained.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Bytes currently retained.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, n: usize) -> OutputBuffer {
        let mut buf = OutputBuffer::new(capacity);
        for i in 0..n {
            buf.push(format!("c{i}").into_bytes());
        }
        buf
    }

    #[test]
    fn zero_limit_returns_everything() {
        let buf = filled(10, 3);
        let slice = buf.slice(0, 0);
        assert_eq!(slice.total, 3);
        assert_eq!(slice.concat(), b"c0c1c2");
        assert_eq!(slice.next_offset(), 3);
    }

    #[test]
    fn limit_bounds_the_window() {
        let buf = filled(10, 5);
        let slice = buf.slice(1, 2);
        assert_eq!(slice.offset, 1);
        assert_eq!(slice.chunks, vec![b"c1".to_vec(), b"c2".to_vec()]);
        assert_eq!(slice.total, 5);
    }

    #[test]
    fn offset_past_end_is_empty_not_error() {
        let buf = filled(10, 2);
        let slice = buf.slice(7, 0);
        assert!(slice.chunks.is_empty());
        assert_eq!(slice.total, 2);
    }

    #[test]
    fn oldest_chunks_are_discarded() {
        let buf = filled(3, 5);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.total(), 5);
        assert_eq!(buf.bytes(), 6);

        // A stale cursor resumes at the oldest retained chunk.
        let slice = buf.slice(0, 0);
        assert_eq!(slice.offset, 2);
        assert_eq!(slice.concat(), b"c2c3c4");
    }

    #[test]
    fn raw_bytes_are_kept_verbatim() {
        let mut buf = OutputBuffer::new(4);
        buf.push(b"\x1b[2J\x1b[".to_vec());
        buf.push(b"H partial".to_vec());
        assert_eq!(buf.slice(0, 0).concat(), b"\x1b[2J\x1b[H partial");
    }
}
