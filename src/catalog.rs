use std::sync::Arc;

use tracing::info;

use crate::error::{EngineError, Result};
use crate::models::RuleDefinition;
use crate::store::DataAccess;

/// Source of the rule set evaluated by one run.
pub struct RuleCatalog {
    store: Arc<dyn DataAccess>,
}

impl RuleCatalog {
    pub fn new(store: Arc<dyn DataAccess>) -> Self {
        Self { store }
    }

    /// Active rules, highest priority first. Any failure here is fatal to
    /// the run and is never retried.
    pub async fn load_active(&self) -> Result<Vec<RuleDefinition>> {
        let mut rules = self
            .store
            .active_rules()
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to load rule catalog: {err}")))?;

        rules.retain(|rule| rule.is_active);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        info!(rules = rules.len(), "loaded active rules");
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RuleCategory, RuleScope, Severity};
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn rule(name: &str, priority: i32, is_active: bool) -> RuleDefinition {
        RuleDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: RuleCategory::Grade,
            conditions: serde_json::json!({"type": "exam_fail", "threshold": 60}),
            severity: Severity::Low,
            scope: RuleScope::Global,
            priority,
            is_active,
        }
    }

    #[tokio::test]
    async fn loads_active_rules_by_descending_priority() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(&rule("low", 1, true)).await.unwrap();
        store.insert_rule(&rule("disabled", 50, false)).await.unwrap();
        store.insert_rule(&rule("high", 10, true)).await.unwrap();

        let rules = RuleCatalog::new(store).load_active().await.unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn unavailable_catalog_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_catalog_unavailable(true);

        let err = RuleCatalog::new(store).load_active().await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
    }
}
