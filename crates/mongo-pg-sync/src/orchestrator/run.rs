//! Sync run records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::EntityType;
use crate::source::OperationKind;
use crate::warehouse::UpsertCounts;

/// Why a pass was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncTrigger {
    /// Warm-up pass right after the engine starts.
    Startup,
    /// Operator or API request.
    Manual,
    /// A change notification. `collection` is None when the feed could not
    /// attribute the change to a single collection.
    Change {
        collection: Option<String>,
        operation: OperationKind,
    },
    /// Periodic reconcile timer.
    Reconcile,
    /// Automatic retry after a failed pass.
    Retry,
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTrigger::Startup => f.write_str("startup"),
            SyncTrigger::Manual => f.write_str("manual"),
            SyncTrigger::Change {
                collection: Some(c),
                operation,
            } => write!(f, "change({} {})", c, operation),
            SyncTrigger::Change {
                collection: None,
                operation,
            } => write!(f, "change(all {})", operation),
            SyncTrigger::Reconcile => f.write_str("reconcile"),
            SyncTrigger::Retry => f.write_str("retry"),
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every entity type committed.
    Succeeded,
    /// An entity type failed after its retries; later types were not attempted.
    Failed,
    /// Shutdown stopped the pass at an entity-type boundary.
    Superseded,
}

/// Per-entity-type result within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReport {
    pub entity: EntityType,
    pub extracted: usize,
    /// Malformed documents left out of the batch.
    pub skipped: usize,
    #[serde(flatten)]
    pub counts: UpsertCounts,
    pub attempts: u32,
}

/// One pipeline pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub trigger: SyncTrigger,
    /// When the earliest request served by this pass was recorded.
    pub requested_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// None while the pass is running.
    pub outcome: Option<RunOutcome>,
    /// Extra requests absorbed into this pass.
    pub coalesced: u64,
    pub entities: Vec<EntityReport>,
    pub error: Option<String>,
}

impl SyncRun {
    pub fn begin(trigger: SyncTrigger, requested_at: DateTime<Utc>, coalesced: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger,
            requested_at,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            coalesced,
            entities: Vec::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome, error: Option<String>) {
        self.outcome = Some(outcome);
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == Some(RunOutcome::Succeeded)
    }

    pub fn totals(&self) -> UpsertCounts {
        let mut totals = UpsertCounts::default();
        for report in &self.entities {
            totals += report.counts;
        }
        totals
    }

    pub fn skipped(&self) -> usize {
        self.entities.iter().map(|r| r.skipped).sum()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    /// Short id for log lines.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Serialize as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_display() {
        assert_eq!(SyncTrigger::Manual.to_string(), "manual");
        let change = SyncTrigger::Change {
            collection: Some("ventas".into()),
            operation: OperationKind::Insert,
        };
        assert_eq!(change.to_string(), "change(ventas insert)");
    }

    #[test]
    fn test_totals_sum_entity_reports() {
        let mut run = SyncRun::begin(SyncTrigger::Manual, Utc::now(), 0);
        for (entity, inserted, skipped) in [(EntityType::Customer, 3, 1), (EntityType::Sale, 2, 0)] {
            run.entities.push(EntityReport {
                entity,
                extracted: inserted as usize + skipped,
                skipped,
                counts: UpsertCounts {
                    inserted,
                    updated: 1,
                    unchanged: 0,
                },
                attempts: 1,
            });
        }
        run.finish(RunOutcome::Succeeded, None);

        assert!(run.succeeded());
        assert_eq!(run.totals().inserted, 5);
        assert_eq!(run.totals().updated, 2);
        assert_eq!(run.skipped(), 1);
        assert!(run.duration_seconds().is_some());
    }

    #[test]
    fn test_run_json_shape() {
        let mut run = SyncRun::begin(
            SyncTrigger::Change {
                collection: None,
                operation: OperationKind::Update,
            },
            Utc::now(),
            4,
        );
        run.entities.push(EntityReport {
            entity: EntityType::SaleLine,
            extracted: 1,
            skipped: 0,
            counts: UpsertCounts::default(),
            attempts: 2,
        });
        run.finish(RunOutcome::Failed, Some("boom".into()));

        let value: serde_json::Value = serde_json::from_str(&run.to_json().unwrap()).unwrap();
        assert_eq!(value["trigger"]["kind"], "change");
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["coalesced"], 4);
        assert_eq!(value["entities"][0]["entity"], "sale_line");
        assert_eq!(value["entities"][0]["inserted"], 0);
        assert_eq!(run.short_id().len(), 8);
    }
}
