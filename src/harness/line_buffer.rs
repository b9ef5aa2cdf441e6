/// Splits a byte stream into lines while enforcing a per-line ceiling.
///
/// Bytes are buffered rather than decoded per chunk so multi-byte characters
/// split across reads survive intact.
#[derive(Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    scanned: usize,
    max_line_bytes: usize,
    overflowed: bool,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes,
            overflowed: false,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    /// Returns every complete line. Once a line exceeds the ceiling the buffer
    /// stops splitting and [`take_overflow`](Self::take_overflow) reports it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.overflowed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|byte| *byte == b'\n')
            else {
                self.scanned = self.buffer.len();
                break;
            };
            let idx = self.scanned + offset;
            let mut end = idx;
            if end > 0 && self.buffer[end - 1] == b'\r' {
                end -= 1;
            }
            if end > self.max_line_bytes {
                self.mark_overflow();
                return lines;
            }
            lines.push(String::from_utf8_lossy(&self.buffer[..end]).into_owned());
            self.buffer.drain(..=idx);
            self.scanned = 0;
        }

        if self.buffer.len() > self.max_line_bytes {
            self.mark_overflow();
        }
        lines
    }

    pub fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    /// Returns the trailing unterminated line, if any.
    pub fn flush(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    fn mark_overflow(&mut self) {
        self.overflowed = true;
        self.buffer.clear();
        self.scanned = 0;
    }
}
