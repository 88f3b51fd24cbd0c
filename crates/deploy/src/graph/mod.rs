//! Action graph construction and scheduling.
//!
//! Modules are expanded into a flat set of actions ([`GraphBuilder`]), each module at most once
//! per build ([`ExpansionCache`]). The resulting [`ActionGraph`] is then linearised into an
//! [`ExecutionPlan`] by [`schedule`].

mod builder;
mod scheduler;

pub use builder::{Expansion, ExpansionCache, GraphBuilder};
pub use scheduler::{ExecutionPlan, schedule};

use indexmap::IndexMap;

use crate::{
    artifact::{ActionId, ModuleId},
    error::BuildError,
    module::{ActionSpec, Dependency},
};

/// An action placed in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphAction {
    pub spec: ActionSpec,
    /// Position of the declaring module in expansion order.
    pub module_ordinal: usize,
    /// Position of the action inside its module.
    pub index: usize,
    pub dependencies: Vec<Dependency>,
}

impl GraphAction {
    pub fn id(&self) -> &ActionId {
        &self.spec.id
    }

    pub fn module(&self) -> ModuleId {
        self.spec.id.module()
    }
}

/// Flat set of actions with their dependency edges.
#[derive(Debug, Clone, Default)]
pub struct ActionGraph {
    actions: IndexMap<ActionId, GraphAction>,
    modules: Vec<ModuleId>,
}

impl ActionGraph {
    pub fn get(&self, id: &ActionId) -> Option<&GraphAction> {
        self.actions.get(id)
    }

    pub fn actions(&self) -> impl Iterator<Item = &GraphAction> {
        self.actions.values()
    }

    /// Modules in expansion order (dependencies before dependents).
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn push_module(&mut self, id: ModuleId) -> usize {
        self.modules.push(id);
        self.modules.len() - 1
    }

    fn insert(&mut self, action: GraphAction) -> Result<(), BuildError> {
        if self.actions.contains_key(action.id()) {
            return Err(BuildError::DuplicateAction(action.id().clone()));
        }
        self.actions.insert(action.id().clone(), action);
        Ok(())
    }

    /// Every dependency must be produced by an included action, and address dependencies
    /// must point at actions that produce one.
    fn check_references(&self) -> Result<(), BuildError> {
        for action in self.actions.values() {
            for dep in &action.dependencies {
                let producer = self.actions.get(&dep.producer).ok_or_else(|| {
                    BuildError::UnresolvedReference {
                        action: action.id().clone(),
                        reference: dep.producer.clone(),
                    }
                })?;
                if dep.needs_address && !producer.spec.kind.produces_address() {
                    return Err(BuildError::NotAnAddress {
                        action: action.id().clone(),
                        reference: dep.producer.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
