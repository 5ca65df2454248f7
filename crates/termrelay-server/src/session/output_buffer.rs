//! Bounded, timestamped log of PTY output for replay on reattach.
//!
//! Append-only, oldest-first. When the entry count exceeds the cap it is cut
//! back to the most recent `trim_to` entries in a single drain, so the O(n)
//! shift happens once per `cap - trim_to` appends rather than on every one.

use std::time::SystemTime;

/// Default maximum number of buffered chunks.
#[cfg(test)]
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
/// Default number of chunks kept after a trim.
#[cfg(test)]
pub const DEFAULT_TRIM_TO: usize = 800;

/// One chunk of PTY output.
#[derive(Debug, Clone)]
pub struct OutputEntry {
    pub data: Vec<u8>,
    pub at: SystemTime,
}

/// Output log with batch trimming.
#[derive(Debug)]
pub struct OutputBuffer {
    entries: Vec<OutputEntry>,
    max_entries: usize,
    trim_to: usize,
}

impl OutputBuffer {
    /// Create a buffer holding at most `max_entries` chunks, trimmed back to
    /// `trim_to` when exceeded. `trim_to` is clamped to `max_entries`.
    pub fn new(max_entries: usize, trim_to: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            trim_to: trim_to.min(max_entries),
        }
    }

    /// Append a chunk, trimming if the cap is exceeded.
    pub fn push(&mut self, data: Vec<u8>) {
        self.entries.push(OutputEntry {
            data,
            at: SystemTime::now(),
        });
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.trim_to;
            self.entries.drain(..excess);
        }
    }

    /// All buffered chunks in arrival order.
    pub fn entries(&self) -> &[OutputEntry] {
        &self.entries
    }

    /// Concatenation of all buffered chunks.
    #[cfg(test)]
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.iter().map(|e| e.data.len()).sum());
        for entry in &self.entries {
            out.extend_from_slice(&entry.data);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_TRIM_TO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order() {
        let mut buf = OutputBuffer::default();
        buf.push(b"one ".to_vec());
        buf.push(b"two".to_vec());
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.contents(), b"one two");
        assert!(buf.entries()[0].at <= buf.entries()[1].at);
    }

    #[test]
    fn trims_in_one_batch_with_hysteresis() {
        let mut buf = OutputBuffer::default();
        let mut trimmed_at_first = None;
        for i in 0..1500u32 {
            buf.push(i.to_string().into_bytes());
            assert!(buf.len() <= DEFAULT_MAX_ENTRIES);
            if i == 1000 {
                trimmed_at_first = Some(buf.len());
            }
        }
        // 1001st append crosses the cap → exactly 800 remain
        assert_eq!(trimmed_at_first, Some(DEFAULT_TRIM_TO));
        // trims again at appends 1201 and 1402; 97 appends since the last one
        assert_eq!(buf.len(), 800 + 97);
        assert_eq!(buf.entries().last().unwrap().data, b"1499");
        assert_eq!(buf.entries()[0].data, b"603");
    }

    #[test]
    fn cap_of_exactly_max_does_not_trim() {
        let mut buf = OutputBuffer::new(5, 3);
        for _ in 0..5 {
            buf.push(b"x".to_vec());
        }
        assert_eq!(buf.len(), 5);
        buf.push(b"y".to_vec());
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.contents(), b"xxy");
    }

    #[test]
    fn trim_to_is_clamped() {
        let mut buf = OutputBuffer::new(2, 10);
        for _ in 0..3 {
            buf.push(b"z".to_vec());
        }
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn empty_buffer() {
        let buf = OutputBuffer::default();
        assert!(buf.is_empty());
        assert!(buf.contents().is_empty());
    }
}
