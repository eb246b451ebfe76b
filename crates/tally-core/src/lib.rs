//! Core domain model for tally: organizations, resource kinds, sync outcomes,
//! remote record shapes, local record shapes and counter keys.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod counters;
pub mod records;
pub mod remote;

pub use counters::{diff_counters, CounterDelta, CounterSet};
pub use records::{
    Boundary, Contact, ContactField, FieldValueType, Gender, LocalRecord, ResolvedAnswer,
};

/// Identifier of an organization whose data is mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub i64);

impl fmt::Display for OrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed categories of synchronized data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Fields,
    Boundaries,
    Contacts,
    PollResults,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Fields => "fields",
            ResourceKind::Boundaries => "boundaries",
            ResourceKind::Contacts => "contacts",
            ResourceKind::PollResults => "poll-results",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one processed remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Created,
    Updated,
    Deleted,
    Ignored,
}

/// Per-run outcome totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub ignored: usize,
}

impl SyncReport {
    pub fn record(&mut self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Created => self.created += 1,
            SyncOutcome::Updated => self.updated += 1,
            SyncOutcome::Deleted => self.deleted += 1,
            SyncOutcome::Ignored => self.ignored += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.ignored
    }

    /// Whether the run changed anything locally.
    pub fn has_mutations(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} deleted={} ignored={}",
            self.created, self.updated, self.deleted, self.ignored
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_each_outcome_once() {
        let mut report = SyncReport::default();
        for outcome in [
            SyncOutcome::Created,
            SyncOutcome::Created,
            SyncOutcome::Ignored,
            SyncOutcome::Deleted,
        ] {
            report.record(outcome);
        }
        assert_eq!(
            report,
            SyncReport {
                created: 2,
                updated: 0,
                deleted: 1,
                ignored: 1
            }
        );
        assert_eq!(report.total(), 4);
        assert!(report.has_mutations());
        assert_eq!(report.to_string(), "created=2 updated=0 deleted=1 ignored=1");
    }

    #[test]
    fn kinds_have_stable_names() {
        assert_eq!(ResourceKind::Fields.as_str(), "fields");
        assert_eq!(ResourceKind::PollResults.to_string(), "poll-results");
        assert_eq!(
            serde_json::to_string(&ResourceKind::PollResults).unwrap(),
            "\"poll-results\""
        );
    }
}
