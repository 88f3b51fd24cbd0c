//! Declarative module definitions.
//!
//! A [`Module`] is a named, reusable unit of deployment: an ordered list of actions plus the ids
//! of the modules it builds on. Modules are plain data; nothing runs until the graph is built,
//! scheduled and handed to the engine.
//!
//! # Example
//!
//! ```
//! use keel_deploy::{ActionOptions, ModuleBuilder, ModuleRegistry};
//!
//! let mut m = ModuleBuilder::new("VaultModule");
//! let crypto = m.library("Crypto", ActionOptions::id("crypto"));
//! let vault = m.contract("Vault", [], ActionOptions::id("vault").library("Crypto", &crypto));
//! let init = m.encode_call(&vault, "initialize", [m.account(0), "1000000000".into()]);
//! m.contract("TransparentUpgradeableProxy", [vault.into(), init], ActionOptions::id("proxy"));
//!
//! let mut registry = ModuleRegistry::default();
//! registry.register(m.build()).unwrap();
//! ```

use std::collections::BTreeMap;

use alloy_core::primitives::{Address, U256};
use indexmap::IndexMap;

use crate::{
    artifact::{ACTION_ID_SEPARATOR, AccountIndex, ActionId, ArtifactReference, ModuleId},
    error::BuildError,
};

/// A value passed to a constructor or function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// Literal coerced to the parameter's ABI type at encoding time (`"42"`, `"true"`, `"[1,2]"`).
    Literal(String),
    /// Address of an artifact.
    Artifact(ArtifactReference),
    /// Address of one of the signing accounts.
    Account(AccountIndex),
    /// Address from the named external input set.
    External(String),
    /// Calldata of another call, e.g. a proxy initializer.
    Encoded(Box<EncodedCall>),
}

/// A function call encoded into bytes without being submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCall {
    /// Action whose interface declares the function.
    pub target: ActionId,
    pub function: String,
    pub args: Vec<Argument>,
}

impl From<ActionId> for Argument {
    fn from(id: ActionId) -> Self {
        Self::Artifact(ArtifactReference::Unresolved(id))
    }
}

impl From<&ActionId> for Argument {
    fn from(id: &ActionId) -> Self {
        Self::from(id.clone())
    }
}

impl From<ArtifactReference> for Argument {
    fn from(reference: ArtifactReference) -> Self {
        Self::Artifact(reference)
    }
}

impl From<Address> for Argument {
    fn from(address: Address) -> Self {
        Self::Artifact(ArtifactReference::Resolved(address))
    }
}

impl From<AccountIndex> for Argument {
    fn from(index: AccountIndex) -> Self {
        Self::Account(index)
    }
}

impl From<&str> for Argument {
    fn from(literal: &str) -> Self {
        Self::Literal(literal.to_string())
    }
}

impl From<String> for Argument {
    fn from(literal: String) -> Self {
        Self::Literal(literal)
    }
}

impl From<u64> for Argument {
    fn from(value: u64) -> Self {
        Self::Literal(value.to_string())
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::Literal(value.to_string())
    }
}

/// Where a [`ActionKind::ReferenceExisting`] action takes its address from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSource {
    External(String),
    Artifact(ArtifactReference),
}

/// The four kinds of on-chain work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    DeployContract {
        contract: String,
        args: Vec<Argument>,
        libraries: BTreeMap<String, ArtifactReference>,
    },
    DeployLibrary {
        library: String,
    },
    ReferenceExisting {
        contract: String,
        at: AddressSource,
    },
    Call {
        target: ActionId,
        function: String,
        args: Vec<Argument>,
    },
}

impl ActionKind {
    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::DeployContract { .. } => "contract",
            Self::DeployLibrary { .. } => "library",
            Self::ReferenceExisting { .. } => "existing",
            Self::Call { .. } => "call",
        }
    }

    /// Whether the action produces an address artifact.
    pub fn produces_address(&self) -> bool {
        !matches!(self, Self::Call { .. })
    }

    /// The artifact (interface) name bound to the produced address.
    pub fn interface(&self) -> Option<&str> {
        match self {
            Self::DeployContract { contract, .. } | Self::ReferenceExisting { contract, .. } => {
                Some(contract)
            }
            Self::DeployLibrary { library } => Some(library),
            Self::Call { .. } => None,
        }
    }
}

/// One declared action, before it is placed in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub id: ActionId,
    pub kind: ActionKind,
    pub from: Option<AccountIndex>,
    pub value: U256,
    /// Explicit ordering edges on top of the data dependencies.
    pub after: Vec<ActionId>,
}

/// A dependency edge read off an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub producer: ActionId,
    /// The action consumes the producer's address (as opposed to ordering only).
    pub needs_address: bool,
}

impl ActionSpec {
    /// Every action this one must run after, in declaration order, without duplicates.
    pub fn dependencies(&self) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = Vec::new();
        let mut push = |producer: &ActionId, needs_address: bool| {
            match deps.iter_mut().find(|d| &d.producer == producer) {
                Some(existing) => existing.needs_address |= needs_address,
                None => deps.push(Dependency {
                    producer: producer.clone(),
                    needs_address,
                }),
            }
        };

        match &self.kind {
            ActionKind::DeployContract {
                args, libraries, ..
            } => {
                for reference in libraries.values() {
                    if let Some(id) = reference.producer() {
                        push(id, true);
                    }
                }
                visit_arguments(args, &mut push);
            }
            ActionKind::DeployLibrary { .. } => {}
            ActionKind::ReferenceExisting { at, .. } => {
                if let AddressSource::Artifact(ArtifactReference::Unresolved(id)) = at {
                    push(id, true);
                }
            }
            ActionKind::Call { target, args, .. } => {
                push(target, true);
                visit_arguments(args, &mut push);
            }
        }

        for id in &self.after {
            push(id, false);
        }

        deps
    }
}

fn visit_arguments(args: &[Argument], push: &mut impl FnMut(&ActionId, bool)) {
    for arg in args {
        match arg {
            Argument::Artifact(ArtifactReference::Unresolved(id)) => push(id, true),
            Argument::Encoded(call) => {
                push(&call.target, true);
                visit_arguments(&call.args, push);
            }
            _ => {}
        }
    }
}

/// A named unit of deployment logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub id: ModuleId,
    pub actions: Vec<ActionSpec>,
    /// Modules whose artifacts this one reads. Referenced, never re-executed.
    pub uses: Vec<ModuleId>,
}

impl Module {
    /// Reference to an artifact declared by this module under the given local id.
    pub fn artifact(&self, local: &str) -> ActionId {
        ActionId::new(&self.id, local)
    }
}

/// Per-action options: id override, sender, value, library links and ordering edges.
#[derive(Debug, Clone, Default)]
pub struct ActionOptions {
    id: Option<String>,
    from: Option<AccountIndex>,
    value: U256,
    libraries: BTreeMap<String, ArtifactReference>,
    after: Vec<ActionId>,
}

impl ActionOptions {
    /// Options with an explicit local id.
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn sender(mut self, account: usize) -> Self {
        self.from = Some(AccountIndex(account));
        self
    }

    pub fn value(mut self, wei: U256) -> Self {
        self.value = wei;
        self
    }

    pub fn library(mut self, name: impl Into<String>, library: &ActionId) -> Self {
        self.libraries
            .insert(name.into(), ArtifactReference::Unresolved(library.clone()));
        self
    }

    /// Link a library that already lives at a known address.
    pub fn library_at(mut self, name: impl Into<String>, address: Address) -> Self {
        self.libraries
            .insert(name.into(), ArtifactReference::Resolved(address));
        self
    }

    pub fn after(mut self, action: &ActionId) -> Self {
        self.after.push(action.clone());
        self
    }
}

/// Fluent construction of a [`Module`].
#[derive(Debug)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(id: impl Into<ModuleId>) -> Self {
        Self {
            module: Module {
                id: id.into(),
                actions: Vec::new(),
                uses: Vec::new(),
            },
        }
    }

    /// Depend on another module and get access to its artifacts.
    pub fn use_module<'m>(&mut self, module: &'m Module) -> &'m Module {
        self.uses(module.id.clone());
        module
    }

    /// Depend on a module by id.
    pub fn uses(&mut self, id: ModuleId) {
        if !self.module.uses.contains(&id) {
            self.module.uses.push(id);
        }
    }

    /// Id of an action of this module declared (or yet to be declared) under `local`.
    pub fn artifact(&self, local: &str) -> ActionId {
        ActionId::new(&self.module.id, local)
    }

    /// Address of a signing account as an argument.
    pub fn account(&self, index: usize) -> Argument {
        Argument::Account(AccountIndex(index))
    }

    pub fn contract(
        &mut self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = Argument>,
        mut options: ActionOptions,
    ) -> ActionId {
        let libraries = std::mem::take(&mut options.libraries);
        self.push(
            ActionKind::DeployContract {
                contract: name.into(),
                args: args.into_iter().collect(),
                libraries,
            },
            options,
        )
    }

    pub fn library(&mut self, name: impl Into<String>, options: ActionOptions) -> ActionId {
        self.push(
            ActionKind::DeployLibrary {
                library: name.into(),
            },
            options,
        )
    }

    /// Bind an already deployed contract under the interface `name`.
    pub fn existing(
        &mut self,
        name: impl Into<String>,
        at: AddressSource,
        options: ActionOptions,
    ) -> ActionId {
        self.push(
            ActionKind::ReferenceExisting {
                contract: name.into(),
                at,
            },
            options,
        )
    }

    pub fn call(
        &mut self,
        target: &ActionId,
        function: impl Into<String>,
        args: impl IntoIterator<Item = Argument>,
        options: ActionOptions,
    ) -> ActionId {
        self.push(
            ActionKind::Call {
                target: target.clone(),
                function: function.into(),
                args: args.into_iter().collect(),
            },
            options,
        )
    }

    /// Calldata for `function` on `target`, to be passed as a `bytes` argument.
    pub fn encode_call(
        &self,
        target: &ActionId,
        function: impl Into<String>,
        args: impl IntoIterator<Item = Argument>,
    ) -> Argument {
        Argument::Encoded(Box::new(EncodedCall {
            target: target.clone(),
            function: function.into(),
            args: args.into_iter().collect(),
        }))
    }

    fn push(&mut self, kind: ActionKind, options: ActionOptions) -> ActionId {
        let id = match options.id {
            Some(local) => ActionId::new(&self.module.id, local),
            None => ActionId::new(&self.module.id, self.module.actions.len()),
        };
        self.module.actions.push(ActionSpec {
            id: id.clone(),
            kind,
            from: options.from,
            value: options.value,
            after: options.after,
        });
        id
    }

    pub fn build(self) -> Module {
        self.module
    }
}

/// All module definitions known to a build, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ModuleRegistry {
    modules: IndexMap<ModuleId, Module>,
}

impl ModuleRegistry {
    pub fn register(&mut self, module: Module) -> Result<(), BuildError> {
        if module.id.is_empty() || module.id.contains(ACTION_ID_SEPARATOR) {
            return Err(BuildError::InvalidModuleId(module.id));
        }
        if self.modules.contains_key(&module.id) {
            return Err(BuildError::DuplicateModule(module.id));
        }
        self.modules.insert(module.id.clone(), module);
        Ok(())
    }

    pub fn get(&self, id: &ModuleId) -> Option<&Module> {
        self.modules.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ModuleId> {
        self.modules.keys()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
