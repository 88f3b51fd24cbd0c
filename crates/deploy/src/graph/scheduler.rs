//! Topological ordering of an [`ActionGraph`].
//!
//! Kahn's algorithm. Among the actions that are ready at the same time the one declared by the
//! earliest expanded module wins, then the one declared first inside that module. The order is
//! therefore stable for identical module definitions, which is what lets a resumed run line its
//! action ids up with the journal.

use std::collections::{BTreeSet, HashMap};

use sha2::{Digest, Sha256};

use super::{ActionGraph, GraphAction};
use crate::{
    artifact::{ActionId, ModuleId},
    error::BuildError,
};

/// Actions in execution order.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    steps: Vec<GraphAction>,
    modules: Vec<ModuleId>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[GraphAction] {
        &self.steps
    }

    pub fn get(&self, id: &ActionId) -> Option<&GraphAction> {
        self.steps.iter().find(|step| step.id() == id)
    }

    pub fn position(&self, id: &ActionId) -> Option<usize> {
        self.steps.iter().position(|step| step.id() == id)
    }

    /// Modules in expansion order.
    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// SHA-256 over the ordered action ids, kinds and dependencies.
    ///
    /// Changes whenever the set or the order of actions changes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.steps {
            hasher.update(step.id().as_bytes());
            hasher.update([0]);
            hasher.update(step.spec.kind.label().as_bytes());
            for dep in &step.dependencies {
                hasher.update([1]);
                hasher.update(dep.producer.as_bytes());
            }
            hasher.update([0xff]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Linearise the graph so that every action comes after the actions it depends on.
pub fn schedule(graph: ActionGraph) -> Result<ExecutionPlan, BuildError> {
    let modules = graph.modules().to_vec();
    let actions: Vec<GraphAction> = graph.actions.into_values().collect();

    let position: HashMap<&ActionId, usize> = actions
        .iter()
        .enumerate()
        .map(|(i, action)| (action.id(), i))
        .collect();

    let mut in_degree = vec![0usize; actions.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];

    for (i, action) in actions.iter().enumerate() {
        for dep in &action.dependencies {
            // The builder guarantees every producer is present.
            if let Some(&producer) = position.get(&dep.producer) {
                dependents[producer].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let key = |i: usize| (actions[i].module_ordinal, actions[i].index, i);

    let mut ready: BTreeSet<(usize, usize, usize)> = (0..actions.len())
        .filter(|&i| in_degree[i] == 0)
        .map(key)
        .collect();

    let mut order = Vec::with_capacity(actions.len());
    while let Some((_, _, current)) = ready.pop_first() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(key(next));
            }
        }
    }

    if order.len() != actions.len() {
        let stuck: Vec<&GraphAction> = actions
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, action)| action)
            .collect();

        let mut cycle_modules: Vec<(usize, ModuleId)> = stuck
            .iter()
            .map(|action| (action.module_ordinal, action.module()))
            .collect();
        cycle_modules.sort();
        cycle_modules.dedup();

        return Err(BuildError::CyclicActions {
            modules: cycle_modules.into_iter().map(|(_, id)| id).collect(),
            actions: stuck.iter().map(|action| action.id().clone()).collect(),
        });
    }

    let mut slots: Vec<Option<GraphAction>> = actions.into_iter().map(Some).collect();
    let steps: Vec<GraphAction> = order
        .into_iter()
        .filter_map(|i| slots[i].take())
        .collect();

    tracing::debug!(steps = steps.len(), "Scheduled execution plan");

    Ok(ExecutionPlan { steps, modules })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        graph::GraphBuilder,
        module::{ActionOptions, AddressSource, ModuleBuilder, ModuleRegistry},
    };

    fn plan_ids(plan: &ExecutionPlan) -> Vec<&str> {
        plan.steps().iter().map(|s| s.id().as_str()).collect()
    }

    fn assert_dependencies_first(plan: &ExecutionPlan) {
        for (i, step) in plan.steps().iter().enumerate() {
            for dep in &step.dependencies {
                let producer = plan.position(&dep.producer).unwrap();
                assert!(producer < i, "{} must run before {}", dep.producer, step.id());
            }
        }
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        // Declared in reverse of the data flow; only edges decide the order.
        let mut m = ModuleBuilder::new("M");
        let admin_id = m.artifact("admin");
        let vault_id = m.artifact("vault");
        m.contract(
            "TransparentUpgradeableProxy",
            [vault_id.clone().into(), admin_id.clone().into(), "0x".into()],
            ActionOptions::id("proxy"),
        );
        m.contract("Vault", [], ActionOptions::id("vault"));
        m.contract("ProxyAdmin", [], ActionOptions::id("admin"));

        let mut registry = ModuleRegistry::default();
        registry.register(m.build()).unwrap();
        let graph = GraphBuilder::new(&registry).build(&["M".into()]).unwrap();
        let plan = schedule(graph).unwrap();

        assert_eq!(plan_ids(&plan), vec!["M#vault", "M#admin", "M#proxy"]);
        assert_dependencies_first(&plan);
    }

    #[test]
    fn test_ties_break_by_module_then_index() {
        let mut base = ModuleBuilder::new("Base");
        base.library("Crypto", ActionOptions::id("crypto"));
        base.contract("ProxyAdmin", [], ActionOptions::id("admin"));
        let base = base.build();

        let mut top = ModuleBuilder::new("Top");
        top.use_module(&base);
        top.contract("MockOracle", [], ActionOptions::id("oracle"));
        top.contract(
            "Vault",
            [],
            ActionOptions::id("vault").library("Crypto", &base.artifact("crypto")),
        );
        let top = top.build();

        let mut registry = ModuleRegistry::default();
        registry.register(top).unwrap();
        registry.register(base).unwrap();

        let first = schedule(GraphBuilder::new(&registry).build(&["Top".into()]).unwrap()).unwrap();
        let second =
            schedule(GraphBuilder::new(&registry).build(&["Top".into()]).unwrap()).unwrap();

        assert_eq!(
            plan_ids(&first),
            vec!["Base#crypto", "Base#admin", "Top#oracle", "Top#vault"]
        );
        assert_eq!(plan_ids(&first), plan_ids(&second));
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn test_action_cycle_names_modules() {
        let mut m = ModuleBuilder::new("Loop");
        let b = m.artifact("b");
        let a = m.existing(
            "Vault",
            AddressSource::Artifact(b.clone().into()),
            ActionOptions::id("a"),
        );
        m.existing("Vault", AddressSource::Artifact(a.into()), ActionOptions::id("b"));
        let mut independent = ModuleBuilder::new("Fine");
        independent.library("Crypto", ActionOptions::id("crypto"));

        let mut registry = ModuleRegistry::default();
        registry.register(independent.build()).unwrap();
        registry.register(m.build()).unwrap();
        let graph = GraphBuilder::new(&registry)
            .build(&["Fine".into(), "Loop".into()])
            .unwrap();

        match schedule(graph).unwrap_err() {
            BuildError::CyclicActions { modules, actions } => {
                assert_eq!(modules, vec![ModuleId::from("Loop")]);
                assert_eq!(actions.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fingerprint_changes_with_actions() {
        let build = |extra: bool| {
            let mut m = ModuleBuilder::new("M");
            m.library("Crypto", ActionOptions::id("crypto"));
            if extra {
                m.library("Dex", ActionOptions::id("dex"));
            }
            let mut registry = ModuleRegistry::default();
            registry.register(m.build()).unwrap();
            schedule(GraphBuilder::new(&registry).build(&["M".into()]).unwrap()).unwrap()
        };

        assert_ne!(build(false).fingerprint(), build(true).fingerprint());
    }
}
