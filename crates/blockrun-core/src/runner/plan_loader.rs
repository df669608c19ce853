//! Subflow plan lookup port.

use std::collections::HashMap;

use blockrun_types::plan::Plan;

use crate::plan::definition::PlanError;

/// Resolves an external plan id for subflow nodes.
///
/// `Ok(None)` means no plan with that id exists.
pub trait PlanLoader: Send + Sync {
    fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError>;
}

/// Plans held in memory, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct MapPlanLoader {
    plans: HashMap<String, Plan>,
}

impl MapPlanLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plan under its own id.
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.insert(plan);
        self
    }

    pub fn insert(&mut self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }
}

impl PlanLoader for MapPlanLoader {
    fn load(&self, plan_id: &str) -> Result<Option<Plan>, PlanError> {
        Ok(self.plans.get(plan_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_by_id() {
        let loader = MapPlanLoader::new().with_plan(Plan::new("shared/notify"));
        assert_eq!(loader.load("shared/notify").unwrap().unwrap().id, "shared/notify");
        assert!(loader.load("missing").unwrap().is_none());
    }
}
