//! # Batch reports: tag categories and telemetry payloads.

use serde::Serialize;

use crate::loader::{Admission, Loader, LoaderState};

/// Tag names of one container, partitioned by outcome.
///
/// Each tag lands in exactly one category, checked in this order:
/// `locked`, `awaiting_consent`, `awaiting_filter`, `ran`, `failed`, `other`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagsByState {
    /// Executed without error in their current run.
    pub ran: Vec<String>,
    /// Finished their current run with a failure state.
    pub failed: Vec<String>,
    /// Waiting on a session or retry, or refused by their filters.
    pub awaiting_filter: Vec<String>,
    /// Held back until consent is granted.
    pub awaiting_consent: Vec<String>,
    /// Locked until [`Loader::unlock`].
    pub locked: Vec<String>,
    /// Everything else: inactive, disabled, cancelled or still running.
    pub other: Vec<String>,
}

impl TagsByState {
    pub(crate) fn push(&mut self, category: Category, name: &str) {
        let bucket = match category {
            Category::Ran => &mut self.ran,
            Category::Failed => &mut self.failed,
            Category::AwaitingFilter => &mut self.awaiting_filter,
            Category::AwaitingConsent => &mut self.awaiting_consent,
            Category::Locked => &mut self.locked,
            Category::Other => &mut self.other,
        };
        bucket.push(name.to_string());
    }

    /// Returns the number of categorized tags.
    pub fn total(&self) -> usize {
        self.ran.len()
            + self.failed.len()
            + self.awaiting_filter.len()
            + self.awaiting_consent.len()
            + self.locked.len()
            + self.other.len()
    }

    /// Compact `name=count` summary for logs and events.
    pub fn summary(&self) -> String {
        format!(
            "ran={} failed={} awaiting_filter={} awaiting_consent={} locked={} other={}",
            self.ran.len(),
            self.failed.len(),
            self.awaiting_filter.len(),
            self.awaiting_consent.len(),
            self.locked.len(),
            self.other.len(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Category {
    Ran,
    Failed,
    AwaitingFilter,
    AwaitingConsent,
    Locked,
    Other,
}

impl Category {
    pub(crate) fn of(tag: &Loader, consent_pending: bool) -> Self {
        if tag.is_locked() {
            return Category::Locked;
        }
        if consent_pending && tag.is_initial() {
            return Category::AwaitingConsent;
        }
        let admission = tag.admission();
        if admission.is_waiting() || matches!(admission, Admission::Failed | Admission::TimedOut) {
            return Category::AwaitingFilter;
        }
        if !tag.is_finished() {
            return Category::Other;
        }
        if tag.succeeded() {
            return Category::Ran;
        }
        let failed = LoaderState::ALL
            .iter()
            .any(|s| s.is_failure() && tag.has_in_current_run(*s));
        if failed { Category::Failed } else { Category::Other }
    }
}

/// Outcome of one tag run, as sent to the telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagReport {
    pub name: String,
    pub run: u32,
    /// Label of the last state entered.
    pub state: &'static str,
    /// Every state entered since the last reset, folded into a mask.
    pub bits: u32,
    pub admission: &'static str,
    pub succeeded: bool,
    pub dedupe: bool,
    /// Label of the most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    /// Milliseconds from run start to finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TagReport {
    pub(crate) fn of(tag: &Loader) -> Self {
        let ts = tag.timestamps();
        let duration_ms = match (ts.before, ts.finished) {
            (Some(start), Some(end)) => Some(end.saturating_duration_since(start).as_millis() as u64),
            _ => None,
        };
        Self {
            name: tag.name().to_string(),
            run: tag.run_count(),
            state: tag.current_state().as_label(),
            bits: tag.history().bits(),
            admission: tag.admission().as_label(),
            succeeded: tag.succeeded(),
            dedupe: tag.dedupe_sent(),
            error: tag.errors().last().map(|e| e.as_label()),
            duration_ms,
        }
    }
}

/// One outbound telemetry batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryBatch {
    pub container: String,
    /// Per-container sequence number, starting at 1.
    pub seq: u64,
    pub tags: Vec<TagReport>,
}

impl TelemetryBatch {
    /// Serializes the batch as compact JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Returns the reported tag names, in report order.
    pub fn names(&self) -> Vec<&str> {
        self.tags.iter().map(|t| t.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_json_skips_absent_fields() {
        let batch = TelemetryBatch {
            container: "main".into(),
            seq: 1,
            tags: vec![TagReport {
                name: "pixel".into(),
                run: 1,
                state: "executed",
                bits: 0b1001111,
                admission: "passed",
                succeeded: true,
                dedupe: false,
                error: None,
                duration_ms: None,
            }],
        };
        let json = batch.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"container":"main","seq":1,"tags":[{"name":"pixel","run":1,"state":"executed","bits":79,"admission":"passed","succeeded":true,"dedupe":false}]}"#
        );
        assert_eq!(batch.names(), vec!["pixel"]);
    }

    #[test]
    fn test_summary_counts_each_category() {
        let mut by_state = TagsByState::default();
        by_state.push(Category::Ran, "a");
        by_state.push(Category::Ran, "b");
        by_state.push(Category::Locked, "c");
        assert_eq!(by_state.total(), 3);
        assert_eq!(
            by_state.summary(),
            "ran=2 failed=0 awaiting_filter=0 awaiting_consent=0 locked=1 other=0"
        );
    }
}
