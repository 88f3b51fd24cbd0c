//! Expansion of modules into an [`ActionGraph`].

use std::{collections::HashMap, sync::Arc};

use super::{ActionGraph, GraphAction};
use crate::{
    artifact::{ActionId, ModuleId},
    error::BuildError,
    module::ModuleRegistry,
};

/// Result of expanding one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub module: ModuleId,
    pub ordinal: usize,
    pub actions: Vec<ActionId>,
}

/// Module id -> expansion, for the duration of a single build.
///
/// Passed explicitly to [`GraphBuilder::expand`] and dropped with the build, so every build
/// starts from nothing and builds can run side by side.
#[derive(Debug, Default)]
pub struct ExpansionCache {
    expanded: HashMap<ModuleId, Arc<Expansion>>,
}

impl ExpansionCache {
    pub fn get(&self, id: &ModuleId) -> Option<Arc<Expansion>> {
        self.expanded.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.expanded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expanded.is_empty()
    }

    fn insert(&mut self, expansion: Expansion) -> Arc<Expansion> {
        let expansion = Arc::new(expansion);
        self.expanded
            .insert(expansion.module.clone(), Arc::clone(&expansion));
        expansion
    }
}

/// Builds an [`ActionGraph`] out of the modules of a registry.
#[derive(Debug, Clone, Copy)]
pub struct GraphBuilder<'r> {
    registry: &'r ModuleRegistry,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r ModuleRegistry) -> Self {
        Self { registry }
    }

    /// Expand `roots` and everything they transitively use. Nothing is executed.
    pub fn build(&self, roots: &[ModuleId]) -> Result<ActionGraph, BuildError> {
        let mut cache = ExpansionCache::default();
        let mut graph = ActionGraph::default();

        for root in roots {
            self.expand(root, &mut cache, &mut Vec::new(), &mut graph)?;
        }

        graph.check_references()?;

        tracing::debug!(
            modules = graph.modules().len(),
            actions = graph.len(),
            "Built action graph"
        );

        Ok(graph)
    }

    /// Expand one module, returning the cached expansion when it was already built.
    ///
    /// `stack` holds the modules currently being expanded and is how module cycles are found.
    pub fn expand(
        &self,
        id: &ModuleId,
        cache: &mut ExpansionCache,
        stack: &mut Vec<ModuleId>,
        graph: &mut ActionGraph,
    ) -> Result<Arc<Expansion>, BuildError> {
        if let Some(expansion) = cache.get(id) {
            tracing::trace!(module = %id, "Reusing expanded module");
            return Ok(expansion);
        }

        if let Some(start) = stack.iter().position(|m| m == id) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(id.clone());
            return Err(BuildError::CyclicDependency { cycle });
        }

        let module = self
            .registry
            .get(id)
            .ok_or_else(|| BuildError::UnknownModule(id.clone()))?;

        stack.push(id.clone());
        for dependency in &module.uses {
            self.expand(dependency, cache, stack, graph)?;
        }
        stack.pop();

        let ordinal = graph.push_module(id.clone());
        let mut actions = Vec::with_capacity(module.actions.len());
        for (index, spec) in module.actions.iter().enumerate() {
            actions.push(spec.id.clone());
            graph.insert(GraphAction {
                dependencies: spec.dependencies(),
                spec: spec.clone(),
                module_ordinal: ordinal,
                index,
            })?;
        }

        tracing::trace!(module = %id, actions = actions.len(), "Expanded module");

        Ok(cache.insert(Expansion {
            module: id.clone(),
            ordinal,
            actions,
        }))
    }
}
