//! Startup signature detection on the hosted instance's stdout.
//!
//! The instance announces readiness with a single line of the form
//! `... Theia app listening on <address>. ...`. The template is a fixed
//! prefix, a captured address (no whitespace), and a `.` followed by
//! whitespace or end of line.

use regex::Regex;

/// Fixed text that precedes the advertised address.
pub const SIGNATURE_PREFIX: &str = "Theia app listening on ";

/// Longest partial line held while waiting for a newline. Anything longer is
/// split on a character boundary and flushed in pieces, so a signature
/// straddling the split is not recognised.
const MAX_PENDING_LINE_BYTES: usize = 64 * 1024;

lazy_static::lazy_static! {
    /// Startup signature, compiled once at first use.
    static ref STARTUP_SIGNATURE_RE: Regex =
        Regex::new(r"Theia app listening on (\S+)\.(?:\s|$)").unwrap();
    /// CSI escape sequences (colours, cursor movement) emitted by loggers.
    static ref ANSI_CSI_RE: Regex = Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap();
}

/// Return the advertised address if `line` carries the startup signature.
pub fn match_startup_line(line: &str) -> Option<&str> {
    // Fast path: skip the regex for the bulk of ordinary log output.
    if !line.contains(SIGNATURE_PREFIX) {
        return None;
    }
    STARTUP_SIGNATURE_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains('\x1b') {
        ANSI_CSI_RE.replace_all(text, "")
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

/// Splits an output byte stream into lines.
///
/// Bytes are held until a newline arrives, so multi-byte UTF-8 sequences split
/// across reads are decoded intact. Invalid UTF-8 is replaced, never rejected.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(self.take_line());
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        while self.pending.len() > MAX_PENDING_LINE_BYTES {
            let cut = char_boundary_before(&self.pending, MAX_PENDING_LINE_BYTES);
            let tail = self.pending.split_off(cut);
            lines.push(self.take_line());
            self.pending = tail;
        }
        lines
    }

    /// Flush a trailing unterminated line at EOF.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw);
        let text = text.strip_suffix('\r').unwrap_or(&*text);
        strip_ansi(text).into_owned()
    }
}

/// Largest index `<= limit` that does not fall inside a UTF-8 sequence.
/// `bytes` must be longer than `limit`.
fn char_boundary_before(bytes: &[u8], limit: usize) -> usize {
    let mut cut = limit;
    // A sequence has at most three continuation bytes.
    while cut > limit.saturating_sub(3) && bytes[cut] & 0xC0 == 0x80 {
        cut -= 1;
    }
    cut
}

/// Lines produced by one chunk, plus the signature address if one of them
/// carried it.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Scan {
    pub lines: Vec<String>,
    pub address: Option<String>,
}

/// Line-oriented scanner that looks for the first startup signature.
///
/// Once an address has been found the scanner reports nothing further; the
/// caller switches to plain line splitting via [`StartupScanner::into_lines`].
#[derive(Debug, Default)]
pub struct StartupScanner {
    lines: LineBuffer,
    found: bool,
}

impl StartupScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Scan {
        let lines = self.lines.push(chunk);
        self.scan(lines)
    }

    /// Scan the trailing unterminated line at EOF.
    pub fn finish(&mut self) -> Scan {
        let lines = self.lines.finish().into_iter().collect();
        self.scan(lines)
    }

    /// Stop scanning but keep splitting the rest of the stream into lines.
    pub fn into_lines(self) -> LineBuffer {
        self.lines
    }

    fn scan(&mut self, lines: Vec<String>) -> Scan {
        let mut address = None;
        if !self.found {
            address = lines
                .iter()
                .find_map(|line| match_startup_line(line))
                .map(str::to_string);
            self.found = address.is_some();
        }
        Scan { lines, address }
    }
}
