/// Splits an arbitrarily chunked byte stream into newline-delimited lines.
///
/// Bytes are buffered rather than text so a multi-byte UTF-8 character
/// split across two deliveries decodes correctly. `\n` never occurs inside
/// a multi-byte sequence, so splitting on the raw byte is safe.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed, trimmed.
    /// Empty lines are returned as empty strings; the classifier drops them.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let Some(last_nl) = self.buf.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.buf.split_off(last_nl + 1);
        let complete = std::mem::replace(&mut self.buf, rest);
        complete[..last_nl]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .collect()
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<String> {
        self.feed(chunk.as_bytes())
    }

    /// The unterminated tail waiting for its newline.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}
