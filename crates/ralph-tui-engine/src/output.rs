//! Per-iteration output history.
//!
//! Keeps the stdout/stderr transcript of finished iterations so remote
//! clients can fetch historic output. Bounded by total bytes; the
//! oldest iterations fall off first.

use std::collections::VecDeque;
use std::sync::RwLock;

/// History size limit (16 MB of transcript).
const HISTORY_BYTES: usize = 16 * 1024 * 1024;

/// Transcript of one finished iteration.
#[derive(Debug, Clone)]
pub struct IterationOutput {
    pub iteration: u32,
    pub output: String,
    pub stderr: String,
}

impl IterationOutput {
    fn bytes(&self) -> usize {
        self.output.len() + self.stderr.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<IterationOutput>,
    total_bytes: usize,
}

/// Bounded store of iteration transcripts.
#[derive(Debug, Default)]
pub struct IterationOutputs {
    inner: RwLock<Inner>,
}

impl IterationOutputs {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the transcript of a finished iteration.
    pub fn record(&self, entry: IterationOutput) {
        let bytes = entry.bytes();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        while inner.total_bytes.saturating_add(bytes) > HISTORY_BYTES {
            match inner.entries.pop_front() {
                Some(front) => {
                    inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes());
                }
                None => break,
            }
        }
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
        inner.entries.push_back(entry);
    }

    /// Fetch the transcript for an iteration, if still retained.
    #[must_use]
    pub fn get(&self, iteration: u32) -> Option<IterationOutput> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .find(|e| e.iteration == iteration)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcripts_are_addressable_by_iteration() {
        let outputs = IterationOutputs::new();
        outputs.record(IterationOutput {
            iteration: 1,
            output: "one".to_string(),
            stderr: String::new(),
        });
        outputs.record(IterationOutput {
            iteration: 2,
            output: "two".to_string(),
            stderr: "warn".to_string(),
        });

        assert_eq!(outputs.get(1).unwrap().output, "one");
        assert_eq!(outputs.get(2).unwrap().stderr, "warn");
        assert!(outputs.get(3).is_none());
    }
}
