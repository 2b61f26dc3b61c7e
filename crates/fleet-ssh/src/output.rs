//! Command output cleanup and line streaming.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with each complete output line as it streams in.
pub type LineHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Clean up a finished output stream.
///
/// Drops one trailing `\n` and then one trailing `\r`, folds `\r\n` into
/// `\n` for pty sessions, and removes ANSI escape sequences and control
/// characters other than `\n` and `\t`.
#[must_use]
pub fn sanitize_output(raw: &[u8], pty: bool) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    let text = text.strip_suffix('\r').unwrap_or(text);

    let text: Cow<'_, str> = if pty && text.contains("\r\n") {
        Cow::Owned(text.replace("\r\n", "\n"))
    } else {
        Cow::Borrowed(text)
    };

    strip_control(&strip_ansi(&text)).into_owned()
}

/// Remove ANSI escape sequences (CSI, OSC, charset designations).
#[must_use]
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    if !text.contains('\x1b') {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('[') => {
                chars.next();
                // Parameters and intermediates run until a final byte in @..~
                for param in chars.by_ref() {
                    if ('@'..='~').contains(&param) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(osc) = chars.next() {
                    if osc == '\x07' {
                        break;
                    }
                    if osc == '\x1b' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            Some('(' | ')' | '*' | '+') => {
                chars.next();
                chars.next();
            }
            Some(next) if next.is_ascii_uppercase() || next == '=' || next == '>' => {
                chars.next();
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

/// Remove control characters other than `\n` and `\t`.
#[must_use]
pub fn strip_control(text: &str) -> Cow<'_, str> {
    let keep = |c: char| !c.is_control() || c == '\n' || c == '\t';
    if text.chars().all(keep) {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(text.chars().filter(|c| keep(*c)).collect())
    }
}

/// Splits a chunked byte stream into lines for a [`LineHandler`].
///
/// Bytes are held until a newline arrives so that lines (and multi-byte
/// characters) split across chunks are delivered whole. Empty lines are
/// skipped; each delivered line ends with `\n`.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    handler: Option<LineHandler>,
}

impl fmt::Debug for LineBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineBuffer")
            .field("pending", &self.pending.len())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl LineBuffer {
    /// Create a buffer feeding `handler`. With no handler, input is dropped.
    #[must_use]
    pub fn new(handler: Option<LineHandler>) -> Self {
        Self {
            pending: Vec::new(),
            handler,
        }
    }

    /// Feed a chunk, delivering every line it completes.
    pub fn push(&mut self, chunk: &[u8]) {
        let Some(handler) = &self.handler else {
            return;
        };
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            deliver(handler, &line[..line.len() - 1]);
        }
    }

    /// Deliver a trailing partial line, if any.
    pub fn finish(&mut self) {
        if let Some(handler) = &self.handler {
            let rest = std::mem::take(&mut self.pending);
            deliver(handler, &rest);
        }
    }
}

fn deliver(handler: &LineHandler, line: &[u8]) {
    let line = String::from_utf8_lossy(line);
    let line = line.strip_suffix('\r').unwrap_or(&line);
    if !line.is_empty() {
        handler(&format!("{line}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[test]
    fn strips_single_trailing_newline() {
        assert_eq!(sanitize_output(b"hello\n", false), "hello");
        assert_eq!(sanitize_output(b"hello\r\n", false), "hello");
        assert_eq!(sanitize_output(b"a\n\n", false), "a\n");
        assert_eq!(sanitize_output(b"", false), "");
    }

    #[test]
    fn pty_folds_crlf() {
        assert_eq!(sanitize_output(b"one\r\ntwo\r\n", true), "one\ntwo");
    }

    #[test]
    fn removes_escape_sequences_and_controls() {
        assert_eq!(sanitize_output(b"\x1b[1;31mred\x1b[0m\x07\n", false), "red");
        assert_eq!(strip_ansi("\x1b]0;title\x07text"), "text");
        assert_eq!(strip_control("tab\there\x00"), "tab\there");
    }

    #[test]
    fn plain_text_is_borrowed() {
        assert!(matches!(strip_ansi("plain"), Cow::Borrowed(_)));
        assert!(matches!(strip_control("plain\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(sanitize_output(b"ok\xff", false), "ok\u{fffd}");
    }

    #[test]
    fn line_buffer_joins_chunks() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        let handler: LineHandler = Arc::new(move |l: &str| sink.lock().unwrap().push(l.to_string()));

        let mut buf = LineBuffer::new(Some(handler));
        buf.push(b"fir");
        buf.push(b"st\n\nsec");
        buf.push(b"ond\r\nthird");
        buf.finish();

        assert_eq!(*lines.lock().unwrap(), vec!["first\n", "second\n", "third\n"]);
    }

    #[test]
    fn line_buffer_without_handler_is_noop() {
        let mut buf = LineBuffer::new(None);
        buf.push(b"ignored\n");
        buf.finish();
        assert!(buf.pending.is_empty());
    }

    proptest! {
        #[test]
        fn sanitized_output_has_no_controls(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
            let out = sanitize_output(&raw, false);
            prop_assert!(out.chars().all(|c| !c.is_control() || c == '\n' || c == '\t'));
        }
    }
}
