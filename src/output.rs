//! Bounded log of the hosted instance's recent output lines.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single line captured from the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Monotonic per supervisor, never reset by `clear`.
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Fixed-capacity line log; the oldest line is evicted first.
#[derive(Debug)]
pub(crate) struct OutputLog {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    next_seq: u64,
}

impl OutputLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    pub(crate) fn push(&mut self, stream: OutputStream, text: String) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.capacity == 0 {
            return seq;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(OutputLine { seq, stream, text });
        seq
    }

    /// Most recent `limit` lines, oldest first. A `limit` of 0 returns all.
    pub(crate) fn recent(&self, limit: usize) -> Vec<OutputLine> {
        let take = if limit == 0 { self.lines.len() } else { limit.min(self.lines.len()) };
        self.lines
            .iter()
            .skip(self.lines.len() - take)
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.lines.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[OutputLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut log = OutputLog::new(3);
        for i in 0..5 {
            log.push(OutputStream::Stdout, format!("line {i}"));
        }
        assert_eq!(log.len(), 3);
        assert_eq!(texts(&log.recent(0)), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn recent_limits_to_newest() {
        let mut log = OutputLog::new(10);
        log.push(OutputStream::Stdout, "a".into());
        log.push(OutputStream::Stderr, "b".into());
        log.push(OutputStream::Stdout, "c".into());
        let recent = log.recent(2);
        assert_eq!(texts(&recent), vec!["b", "c"]);
        assert_eq!(recent[0].stream, OutputStream::Stderr);
        assert_eq!(texts(&log.recent(50)).len(), 3);
    }

    #[test]
    fn clear_keeps_sequence_monotonic() {
        let mut log = OutputLog::new(4);
        log.push(OutputStream::Stdout, "a".into());
        log.push(OutputStream::Stdout, "b".into());
        log.clear();
        assert!(log.recent(0).is_empty());
        assert_eq!(log.push(OutputStream::Stdout, "c".into()), 3);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut log = OutputLog::new(0);
        log.push(OutputStream::Stdout, "dropped".into());
        assert_eq!(log.len(), 0);
    }
}
