//! Bounded output buffer that retains the newest characters of a child's
//! stdout or stderr, so unbounded child output never grows daemon memory.

/// Default bound for each captured stream, in characters.
pub const OUTPUT_LIMIT_CHARS: usize = 200_000;

#[derive(Debug, Clone)]
pub struct OutputRing {
    buffer: String,
    char_len: usize,
    limit: usize,
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::new(OUTPUT_LIMIT_CHARS)
    }
}

impl OutputRing {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            char_len: 0,
            limit: limit.max(1),
        }
    }

    /// Append a chunk, dropping the oldest characters once over the limit.
    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        self.char_len += chunk.chars().count();
        if self.char_len > self.limit {
            let drop = self.char_len - self.limit;
            let byte_idx = self
                .buffer
                .char_indices()
                .nth(drop)
                .map(|(idx, _)| idx)
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..byte_idx);
            self.char_len = self.limit;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buffer
    }

    /// Retained length in characters.
    pub fn char_len(&self) -> usize {
        self.char_len
    }

    /// Exact character slice with paging metadata: `(output, total,
    /// next_offset, has_more)`.
    pub fn slice(&self, offset: usize, limit: usize) -> (String, usize, usize, bool) {
        let total = self.char_len;
        let output: String = self.buffer.chars().skip(offset).take(limit).collect();
        let next_offset = offset.min(total) + output.chars().count();
        let has_more = next_offset < total;
        (output, total, next_offset, has_more)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_only_the_newest_characters() {
        let mut ring = OutputRing::new(10);
        ring.push("0123456789");
        ring.push("abcde");
        assert_eq!(ring.as_str(), "56789abcde");
        assert_eq!(ring.char_len(), 10);
    }

    #[test]
    fn large_single_chunk_is_tail_clipped() {
        let mut ring = OutputRing::new(5);
        ring.push("abcdefghij");
        assert_eq!(ring.as_str(), "fghij");
    }

    #[test]
    fn trimming_respects_multibyte_boundaries() {
        let mut ring = OutputRing::new(4);
        ring.push("ααββγγ");
        assert_eq!(ring.char_len(), 4);
        assert_eq!(ring.as_str(), "ββγγ");
    }

    #[test]
    fn slice_returns_exact_window_with_paging() {
        let mut ring = OutputRing::new(100);
        ring.push("0123456789");
        let (output, total, next_offset, has_more) = ring.slice(2, 4);
        assert_eq!(output, "2345");
        assert_eq!(total, 10);
        assert_eq!(next_offset, 6);
        assert!(has_more);

        let (output, _, next_offset, has_more) = ring.slice(6, 10);
        assert_eq!(output, "6789");
        assert_eq!(next_offset, 10);
        assert!(!has_more);

        let (output, total, next_offset, has_more) = ring.slice(50, 4);
        assert!(output.is_empty());
        assert_eq!(total, 10);
        assert_eq!(next_offset, 10);
        assert!(!has_more);
    }
}
