//! Per-session accumulator for generated fragments.

/// Accumulates fragments, detects the end-of-turn sentinel and batches
/// chunk updates.
///
/// Text that could be the start of a sentinel split across fragments is
/// held back from chunks until the next fragment decides it.
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    sentinel: String,
    flush_every: usize,
    raw: String,
    flushed_len: usize,
    pending: usize,
    saw_sentinel: bool,
}

impl StreamBuffer {
    /// An empty `sentinel` disables sentinel detection. `flush_every` of 0
    /// is treated as 1.
    pub fn new(sentinel: impl Into<String>, flush_every: usize) -> Self {
        Self {
            sentinel: sentinel.into(),
            flush_every: flush_every.max(1),
            raw: String::new(),
            flushed_len: 0,
            pending: 0,
            saw_sentinel: false,
        }
    }

    /// Append a fragment. Returns `true` once the sentinel has been seen;
    /// the text is then truncated at the sentinel and later pushes are
    /// ignored.
    pub fn push(&mut self, fragment: &str) -> bool {
        if self.saw_sentinel {
            return true;
        }
        let before = self.raw.len();
        self.raw.push_str(fragment);
        self.pending += 1;

        if self.sentinel.is_empty() {
            return false;
        }
        let mut start = before.saturating_sub(self.sentinel.len() - 1);
        while !self.raw.is_char_boundary(start) {
            start -= 1;
        }
        if let Some(pos) = self.raw[start..].find(&self.sentinel) {
            self.raw.truncate(start + pos);
            self.flushed_len = self.flushed_len.min(self.raw.len());
            self.saw_sentinel = true;
        }
        self.saw_sentinel
    }

    /// Whether enough fragments are pending for a chunk update.
    pub fn should_flush(&self) -> bool {
        self.pending >= self.flush_every
    }

    /// Take unflushed text, holding back a possible partial sentinel.
    pub fn take_chunk(&mut self) -> Option<String> {
        let end = self.raw.len() - self.partial_sentinel_len();
        self.take_until(end)
    }

    /// Take all unflushed text. Used for the final flush.
    pub fn take_remaining(&mut self) -> Option<String> {
        self.take_until(self.raw.len())
    }

    fn take_until(&mut self, end: usize) -> Option<String> {
        self.pending = 0;
        if end <= self.flushed_len {
            return None;
        }
        let chunk = self.raw[self.flushed_len..end].to_string();
        self.flushed_len = end;
        Some(chunk)
    }

    /// Length of the longest suffix of the text that is a proper prefix of
    /// the sentinel.
    fn partial_sentinel_len(&self) -> usize {
        if self.saw_sentinel {
            return 0;
        }
        (1..self.sentinel.len())
            .rev()
            .filter(|&k| self.sentinel.is_char_boundary(k))
            .find(|&k| self.raw.ends_with(&self.sentinel[..k]))
            .unwrap_or(0)
    }

    pub fn saw_sentinel(&self) -> bool {
        self.saw_sentinel
    }

    /// Accumulated text so far, sentinel excluded.
    pub fn text(&self) -> &str {
        &self.raw
    }

    pub fn into_text(self) -> String {
        self.raw
    }
}
