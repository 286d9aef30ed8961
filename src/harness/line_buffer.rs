/// Reassembles complete lines from arbitrarily split text chunks.
///
/// `\n`, `\r\n` and bare `\r` all terminate a line; a `\r\n` pair split across
/// two chunks still counts as one terminator.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
    max_pending_bytes: Option<usize>,
    dropped_bytes: usize,
    swallow_lf: bool,
}

impl LineBuffer {
    pub fn new(max_pending_bytes: Option<usize>) -> Self {
        Self {
            pending: String::new(),
            max_pending_bytes,
            dropped_bytes: 0,
            swallow_lf: false,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for ch in chunk.chars() {
            if self.swallow_lf {
                self.swallow_lf = false;
                if ch == '\n' {
                    continue;
                }
            }
            match ch {
                '\n' => lines.push(std::mem::take(&mut self.pending)),
                '\r' => {
                    lines.push(std::mem::take(&mut self.pending));
                    self.swallow_lf = true;
                }
                other => self.pending.push(other),
            }
        }
        self.enforce_limit();
        lines
    }

    /// Bytes discarded from an over-long unterminated line since the last call.
    pub fn take_dropped_bytes(&mut self) -> usize {
        std::mem::take(&mut self.dropped_bytes)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn flush(&mut self) -> Option<String> {
        self.swallow_lf = false;
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    fn enforce_limit(&mut self) {
        let Some(max) = self.max_pending_bytes else {
            return;
        };
        if self.pending.len() <= max {
            return;
        }
        let mut cut = self.pending.len() - max;
        while !self.pending.is_char_boundary(cut) {
            cut += 1;
        }
        self.pending.drain(..cut);
        self.dropped_bytes = self.dropped_bytes.saturating_add(cut);
    }
}
