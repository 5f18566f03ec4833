//! Skip and retry classification for item-level failures.

use batchline_types::definition::{ChunkDefinition, ExceptionFilter};

use crate::artifact::ItemError;

/// Decides whether an error kind belongs to a class (skippable or retryable).
///
/// Entries are dotted prefixes: `io` covers `io` and `io.remote.Timeout` but
/// not `iox`. The longest matching entry across both lists wins; on a tie
/// the exclude list wins. No match means not in the class.
#[derive(Debug, Clone, Default)]
pub struct ExceptionClassifier {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl ExceptionClassifier {
    pub fn new(filter: &ExceptionFilter) -> Self {
        Self {
            include: filter.include.clone(),
            exclude: filter.exclude.clone(),
        }
    }

    pub fn matches(&self, kind: &str) -> bool {
        let best_include = best_match(&self.include, kind);
        let best_exclude = best_match(&self.exclude, kind);
        match (best_include, best_exclude) {
            (Some(inc), Some(exc)) => inc > exc,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Length of the longest entry that is `kind` itself or a dotted ancestor of it.
fn best_match(entries: &[String], kind: &str) -> Option<usize> {
    entries
        .iter()
        .filter(|entry| {
            kind == entry.as_str()
                || entry.as_str() == "*"
                || (kind.starts_with(entry.as_str())
                    && kind.as_bytes().get(entry.len()) == Some(&b'.'))
        })
        .map(|entry| if entry == "*" { 0 } else { entry.len() })
        .max()
}

/// What the chunk loop does with one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemAction {
    Retry,
    Skip,
    Fatal,
}

/// Per-step skip/retry state. Counters are cumulative across the step.
#[derive(Debug, Clone)]
pub struct ItemPolicy {
    skippable: ExceptionClassifier,
    retryable: ExceptionClassifier,
    skip_limit: Option<u32>,
    retry_limit: Option<u32>,
    skip_count: u32,
    retry_count: u32,
}

impl ItemPolicy {
    pub fn new(chunk: &ChunkDefinition) -> Self {
        Self {
            skippable: ExceptionClassifier::new(&chunk.skippable),
            retryable: ExceptionClassifier::new(&chunk.retryable),
            skip_limit: chunk.skip_limit,
            retry_limit: chunk.retry_limit,
            skip_count: 0,
            retry_count: 0,
        }
    }

    /// Classify `error` and consume one retry or skip if granted.
    ///
    /// A retryable error is retried while retries remain; once the limit is
    /// exhausted it falls through to skip classification. A skippable error
    /// is skipped while skips remain. Everything else is fatal.
    pub fn classify(&mut self, error: &ItemError) -> ItemAction {
        if self.retryable.matches(&error.kind) && within(self.retry_count, self.retry_limit) {
            self.retry_count += 1;
            return ItemAction::Retry;
        }
        if self.skippable.matches(&error.kind) && within(self.skip_count, self.skip_limit) {
            self.skip_count += 1;
            return ItemAction::Skip;
        }
        ItemAction::Fatal
    }

    /// Classification for a whole failed batch write. A retry is consumed as
    /// usual, but `Skip` only reports that the error is skippable: the
    /// caller re-attempts the batch item by item and each item failure is
    /// classified (and counted) on its own.
    pub fn classify_batch(&mut self, error: &ItemError) -> ItemAction {
        if self.retryable.matches(&error.kind) && within(self.retry_count, self.retry_limit) {
            self.retry_count += 1;
            return ItemAction::Retry;
        }
        if self.skippable.matches(&error.kind) && within(self.skip_count, self.skip_limit) {
            return ItemAction::Skip;
        }
        ItemAction::Fatal
    }

    pub fn skip_count(&self) -> u32 {
        self.skip_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

fn within(count: u32, limit: Option<u32>) -> bool {
    limit.is_none_or(|limit| count < limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    use batchline_types::definition::{ArtifactRef, CheckpointPolicy};

    fn filter(include: &[&str], exclude: &[&str]) -> ExceptionFilter {
        ExceptionFilter {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn chunk(skippable: ExceptionFilter, retryable: ExceptionFilter) -> ChunkDefinition {
        ChunkDefinition {
            reader: ArtifactRef::named("r"),
            processor: None,
            writer: ArtifactRef::named("w"),
            checkpoint: CheckpointPolicy::default(),
            skip_limit: None,
            retry_limit: None,
            skippable,
            retryable,
        }
    }

    #[test]
    fn most_specific_entry_wins() {
        let c = ExceptionClassifier::new(&filter(&["io", "io.remote.Fatal.Soft"], &["io.remote"]));
        assert!(c.matches("io.disk.Full"));
        assert!(!c.matches("io.remote.Timeout"));
        assert!(c.matches("io.remote.Fatal.Soft"));
        assert!(!c.matches("iox.Other"));
        assert!(!c.matches("net.Reset"));
    }

    #[test]
    fn exclude_wins_ties() {
        let c = ExceptionClassifier::new(&filter(&["data.Bad"], &["data.Bad"]));
        assert!(!c.matches("data.Bad"));
    }

    #[test]
    fn wildcard_entry_matches_everything_least_specifically() {
        let c = ExceptionClassifier::new(&filter(&["*"], &["fatal"]));
        assert!(c.matches("anything.At.All"));
        assert!(!c.matches("fatal.Crash"));
    }

    #[test]
    fn skip_limit_converts_to_fatal() {
        let mut def = chunk(filter(&["data"], &[]), ExceptionFilter::default());
        def.skip_limit = Some(1);
        let mut policy = ItemPolicy::new(&def);
        let err = ItemError::new("data.Malformed", "bad row");
        assert_eq!(policy.classify(&err), ItemAction::Skip);
        assert_eq!(policy.classify(&err), ItemAction::Fatal);
        assert_eq!(policy.skip_count(), 1);
    }

    #[test]
    fn exhausted_retry_falls_through_to_skip() {
        let mut def = chunk(filter(&["io"], &[]), filter(&["io"], &[]));
        def.retry_limit = Some(2);
        let mut policy = ItemPolicy::new(&def);
        let err = ItemError::new("io.Timeout", "slow");
        assert_eq!(policy.classify(&err), ItemAction::Retry);
        assert_eq!(policy.classify(&err), ItemAction::Retry);
        assert_eq!(policy.classify(&err), ItemAction::Skip);
        assert_eq!(policy.retry_count(), 2);
    }

    #[test]
    fn unmapped_errors_are_fatal() {
        let mut policy = ItemPolicy::new(&chunk(ExceptionFilter::default(), ExceptionFilter::default()));
        assert_eq!(policy.classify(&ItemError::new("io.Timeout", "x")), ItemAction::Fatal);
    }

    #[test]
    fn batch_classification_does_not_consume_skips() {
        let mut def = chunk(filter(&["data"], &[]), ExceptionFilter::default());
        def.skip_limit = Some(1);
        let mut policy = ItemPolicy::new(&def);
        let err = ItemError::new("data.Bad", "x");
        assert_eq!(policy.classify_batch(&err), ItemAction::Skip);
        assert_eq!(policy.classify_batch(&err), ItemAction::Skip);
        assert_eq!(policy.skip_count(), 0);
        assert_eq!(policy.classify(&err), ItemAction::Skip);
        assert_eq!(policy.classify_batch(&err), ItemAction::Fatal);
    }
}
