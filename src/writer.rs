use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::evaluator::RuleMatch;
use crate::models::{InsertOutcome, WarningRecord};
use crate::store::DataAccess;

/// Persists warnings with at most one active record per `(entity_id, rule_id)`.
///
/// The existence check only skips needless inserts. Correctness under
/// concurrent runs rests on the store rejecting a second active row for the
/// same pair (a partial unique index in Postgres, a single lock in memory).
pub struct WarningWriter {
    store: Arc<dyn DataAccess>,
}

impl WarningWriter {
    pub fn new(store: Arc<dyn DataAccess>) -> Self {
        Self { store }
    }

    /// Returns `true` when a new warning row was created.
    pub async fn write(&self, rule_id: Uuid, matched: &RuleMatch) -> Result<bool> {
        if self.store.has_active_warning(&matched.entity_id, rule_id).await? {
            debug!(entity_id = %matched.entity_id, %rule_id, "active warning already present");
            return Ok(false);
        }

        let warning = WarningRecord::new_active(&matched.entity_id, rule_id, matched.details.clone());
        match self.store.insert_warning(&warning).await? {
            InsertOutcome::Inserted => Ok(true),
            InsertOutcome::Duplicate => {
                debug!(entity_id = %matched.entity_id, %rule_id, "lost insert race to a concurrent writer");
                Ok(false)
            }
        }
    }
}
