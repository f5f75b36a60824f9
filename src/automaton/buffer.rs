//! Accumulated terminal output with line-ending normalization

use regex::Regex;

/// Output read from the pseudo-terminal so far.
///
/// Bytes are decoded incrementally: a UTF-8 sequence or a `\r\n` pair split
/// across two reads is reassembled before it reaches the text. Every `\r\n`
/// becomes `\n`. Matching only considers text after the previous match.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    text: String,
    cursor: usize,
    partial: Vec<u8>,
    pending_cr: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the terminal
    pub fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let decoded = take_complete_utf8(&mut self.partial);
        self.append_normalized(&decoded);
    }

    /// Flush anything held back waiting for more input; called at end-of-stream
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            let rest = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.append_normalized(&rest);
        }
        if self.pending_cr {
            self.pending_cr = false;
            self.text.push('\r');
        }
    }

    /// Search the unmatched tail for `pattern`; on success the tail starts after the match
    pub fn find(&mut self, pattern: &Regex) -> Option<String> {
        let m = pattern.find(&self.text[self.cursor..])?;
        let matched = m.as_str().to_string();
        self.cursor += m.end();
        Some(matched)
    }

    /// Everything read so far, normalized
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text produced since the previous match
    pub fn unmatched(&self) -> &str {
        &self.text[self.cursor..]
    }

    pub fn into_text(mut self) -> String {
        self.finish();
        self.text
    }

    fn append_normalized(&mut self, s: &str) {
        for c in s.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                if c == '\n' {
                    self.text.push('\n');
                    continue;
                }
                self.text.push('\r');
            }
            if c == '\r' {
                self.pending_cr = true;
            } else {
                self.text.push(c);
            }
        }
    }
}

/// Decode the longest complete prefix of `buf`, leaving an incomplete trailing
/// sequence in place. Invalid sequences become U+FFFD.
fn take_complete_utf8(buf: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(s) => {
                out.push_str(s);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&buf[..valid]));
                match e.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.drain(..valid + len);
                    }
                    None => {
                        buf.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}
