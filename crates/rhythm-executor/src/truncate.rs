//! Bounded output capture.
//!
//! Job output can be arbitrarily large (a verbose build tool easily prints
//! megabytes).  Only the tail is kept: the final lines carry the error that
//! made the run fail, which is what the DLQ detail and logs need.

/// Default bytes retained per stream (64 KiB).
pub const DEFAULT_MAX_BYTES: usize = 64 * 1024;

/// Characters of stderr copied into failure details.
pub const DETAIL_TAIL_CHARS: usize = 2_000;

/// Append-only byte buffer that keeps only the last `cap` bytes written.
///
/// Output is redacted after capture, so the retained text must never start
/// in the middle of a line: a cut through `postgres://user:pw@host` would
/// leave `:pw@host` with nothing for the redaction rules to anchor on.
/// [`TailBuffer::into_text`] therefore drops a partial first line.
#[derive(Debug)]
pub struct TailBuffer {
    buf: Vec<u8>,
    cap: usize,
    omitted: usize,
    /// The byte before `buf` was a newline (or nothing was dropped).
    line_start: bool,
}

impl TailBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap: cap.max(1),
            omitted: 0,
            line_start: true,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            let cut = chunk.len() - self.cap;
            self.line_start = match cut.checked_sub(1) {
                Some(last) => chunk[last] == b'\n',
                None => self.buf.last().map_or(self.line_start, |b| *b == b'\n'),
            };
            self.omitted += self.buf.len() + cut;
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[cut..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.line_start = self.buf[overflow - 1] == b'\n';
            self.buf.drain(..overflow);
            self.omitted += overflow;
        }
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes discarded so far.
    pub fn omitted(&self) -> usize {
        self.omitted
    }

    /// Decode the retained bytes as text with ANSI escapes removed.
    ///
    /// The cut may land inside a multi-byte sequence; lossy decoding turns
    /// that into a replacement character instead of failing.
    ///
    /// When the cut landed mid-line, everything up to the first newline is
    /// dropped as well (all of it if there is none) and counted as omitted.
    pub fn into_text(self) -> String {
        let mut omitted = self.omitted;
        let mut kept: &[u8] = &self.buf;
        if omitted > 0 && !self.line_start {
            let skip = kept
                .iter()
                .position(|b| *b == b'\n')
                .map_or(kept.len(), |i| i + 1);
            omitted += skip;
            kept = &kept[skip..];
        }
        let clean = strip_ansi_escapes::strip(kept);
        let text = String::from_utf8_lossy(&clean).into_owned();
        if omitted > 0 {
            format!("... [{omitted} bytes omitted] ...\n{text}")
        } else {
            text
        }
    }
}

/// Keep the last `max_chars` characters of `text`.
///
/// Splits on character boundaries, never inside a multi-byte sequence.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }
    let skip = total - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("[{skip} chars omitted] {tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_input_kept_whole() {
        let mut t = TailBuffer::new(16);
        t.push(b"hello");
        assert_eq!(t.omitted(), 0);
        assert_eq!(t.into_text(), "hello");
    }

    #[test]
    fn keeps_last_bytes_across_chunks() {
        let mut t = TailBuffer::new(8);
        t.push(b"aaa\n");
        t.push(b"bbb\n");
        t.push(b"ccc\n");
        assert_eq!(t.omitted(), 4);
        let text = t.into_text();
        assert!(text.ends_with("bbb\nccc\n"));
        assert!(text.contains("4 bytes omitted"));
    }

    #[test]
    fn single_oversized_chunk() {
        let mut t = TailBuffer::new(4);
        t.push(b"xx");
        t.push(b"01234\n6789");
        assert_eq!(t.omitted(), 8);
        assert_eq!(t.into_text(), "... [8 bytes omitted] ...\n6789");
    }

    #[test]
    fn partial_first_line_dropped() {
        let mut t = TailBuffer::new(20);
        t.push(b"noise line\npostgres://etl:hunter2@db/wh\nerror: boom\n");
        let text = t.into_text();
        assert!(!text.contains("hunter"));
        assert!(!text.contains("db/wh"));
        assert_eq!(text, "... [40 bytes omitted] ...\nerror: boom\n");
    }

    #[test]
    fn cut_inside_single_line_keeps_nothing_of_it() {
        let mut t = TailBuffer::new(20);
        t.push(b"postgres://");
        t.push(b"etl:hunter2@db/wh");
        let text = t.into_text();
        assert!(!text.contains("hunter2"));
        assert_eq!(text, "... [28 bytes omitted] ...\n");
    }

    #[test]
    fn cut_on_line_boundary_keeps_first_line() {
        let mut t = TailBuffer::new(6);
        t.push(b"first\n");
        t.push(b"second");
        assert_eq!(t.into_text(), "... [6 bytes omitted] ...\nsecond");
    }

    #[test]
    fn ansi_sequences_stripped() {
        let mut t = TailBuffer::new(64);
        t.push(b"\x1b[31merror\x1b[0m: boom");
        assert_eq!(t.into_text(), "error: boom");
    }

    #[test]
    fn tail_chars_respects_boundaries() {
        let s: String = "€".repeat(50);
        let out = tail_chars(&s, 10);
        assert!(out.starts_with("[40 chars omitted]"));
        assert!(out.ends_with(&"€".repeat(10)));
        assert_eq!(tail_chars("abc", 10), "abc");
    }
}
