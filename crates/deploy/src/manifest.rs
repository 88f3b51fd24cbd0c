//! TOML module descriptions.
//!
//! ```toml
//! [[module]]
//! id = "VaultModule"
//! uses = ["LibraryModule"]
//!
//! [[module.action]]
//! kind = "contract"
//! id = "vault"
//! name = "Vault"
//! libraries = { Crypto = "LibraryModule#crypto" }
//!
//! [[module.action]]
//! kind = "contract"
//! id = "proxy"
//! name = "TransparentUpgradeableProxy"
//! args = [
//!     { artifact = "vault" },
//!     { account = 0 },
//!     { encode = { target = "vault", function = "initialize", args = [{ external = "oracle" }, "1000"] } },
//! ]
//! ```
//!
//! Action references without a `#` are local to the declaring module.

use std::{collections::BTreeMap, path::Path, str::FromStr};

use alloy_core::primitives::{Address, U256};
use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{
    artifact::{AccountIndex, ActionId, ArtifactReference, ModuleId},
    module::{ActionOptions, AddressSource, Argument, EncodedCall, ModuleBuilder, ModuleRegistry},
};

/// A parsed module description file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleDef {
    pub id: String,
    #[serde(default)]
    pub uses: Vec<String>,
    #[serde(default, rename = "action")]
    pub actions: Vec<ActionDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionKindDef {
    Contract,
    Library,
    Existing,
    Call,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionDef {
    pub kind: ActionKindDef,
    /// Local id override.
    #[serde(default)]
    pub id: Option<String>,
    /// Contract, library or interface name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgumentDef>,
    #[serde(default)]
    pub libraries: BTreeMap<String, LibraryDef>,
    #[serde(default)]
    pub at: Option<AtDef>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub from: Option<usize>,
    #[serde(default)]
    pub value: Option<ValueDef>,
    #[serde(default)]
    pub after: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgumentDef {
    Reference(ReferenceDef),
    Literal(LiteralDef),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDef {
    Artifact(String),
    Account(usize),
    External(String),
    Address(Address),
    Encode(EncodeDef),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodeDef {
    pub target: String,
    pub function: String,
    #[serde(default)]
    pub args: Vec<ArgumentDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LiteralDef {
    Bool(bool),
    Integer(i64),
    String(String),
    Array(Vec<LiteralDef>),
}

impl std::fmt::Display for LiteralDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
            Self::String(s) => f.write_str(s),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LibraryDef {
    Action(String),
    Address { address: Address },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AtDef {
    External(String),
    Artifact(String),
    Address(Address),
}

/// Wei amount, as an integer or a decimal/hex string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValueDef {
    Integer(u64),
    String(String),
}

impl Manifest {
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse module description as TOML")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read module description {}", path.display()))?;
        let manifest = Self::from_toml(&content)
            .with_context(|| format!("Invalid module description {}", path.display()))?;
        tracing::debug!(path = %path.display(), modules = manifest.modules.len(), "Module description loaded");
        Ok(manifest)
    }

    /// Ids of every declared module, in file order.
    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.iter().map(|m| ModuleId::new(&m.id)).collect()
    }

    /// Convert into module definitions.
    pub fn to_registry(&self) -> Result<ModuleRegistry> {
        let mut registry = ModuleRegistry::default();
        for module in &self.modules {
            let built = module
                .build()
                .with_context(|| format!("Invalid module `{}`", module.id))?;
            registry.register(built)?;
        }
        Ok(registry)
    }
}

impl ModuleDef {
    fn build(&self) -> Result<crate::Module> {
        let id = ModuleId::new(&self.id);
        let mut builder = ModuleBuilder::new(id.clone());
        for used in &self.uses {
            builder.uses(ModuleId::new(used));
        }

        for (index, action) in self.actions.iter().enumerate() {
            action
                .add_to(&id, &mut builder)
                .with_context(|| format!("Invalid {} action #{}", action.kind, index))?;
        }

        Ok(builder.build())
    }
}

impl ActionDef {
    fn add_to(&self, module: &ModuleId, builder: &mut ModuleBuilder) -> Result<()> {
        if self.kind != ActionKindDef::Contract && !self.libraries.is_empty() {
            anyhow::bail!("`libraries` is only valid on contract actions");
        }

        let mut options = match &self.id {
            Some(id) => ActionOptions::id(id),
            None => ActionOptions::default(),
        };
        if let Some(from) = self.from {
            options = options.sender(from);
        }
        if let Some(value) = &self.value {
            options = options.value(value.to_wei()?);
        }
        for after in &self.after {
            options = options.after(&action_ref(module, after)?);
        }

        match self.kind {
            ActionKindDef::Contract => {
                for (name, library) in &self.libraries {
                    options = match library {
                        LibraryDef::Action(id) => options.library(name, &action_ref(module, id)?),
                        LibraryDef::Address { address } => options.library_at(name, *address),
                    };
                }
                builder.contract(self.required_name()?, arguments(module, &self.args)?, options);
            }
            ActionKindDef::Library => {
                builder.library(self.required_name()?, options);
            }
            ActionKindDef::Existing => {
                let at = match self.at.as_ref().context("`at` is required")? {
                    AtDef::External(name) => AddressSource::External(name.clone()),
                    AtDef::Artifact(id) => {
                        AddressSource::Artifact(ArtifactReference::Unresolved(action_ref(module, id)?))
                    }
                    AtDef::Address(address) => {
                        AddressSource::Artifact(ArtifactReference::Resolved(*address))
                    }
                };
                builder.existing(self.required_name()?, at, options);
            }
            ActionKindDef::Call => {
                let target = action_ref(module, self.target.as_deref().context("`target` is required")?)?;
                let function = self.function.as_deref().context("`function` is required")?;
                builder.call(&target, function, arguments(module, &self.args)?, options);
            }
        }

        Ok(())
    }

    fn required_name(&self) -> Result<&str> {
        self.name.as_deref().context("`name` is required")
    }
}

impl ValueDef {
    fn to_wei(&self) -> Result<U256> {
        match self {
            Self::Integer(value) => Ok(U256::from(*value)),
            Self::String(value) => {
                U256::from_str(value).context(format!("Invalid wei amount `{}`", value))
            }
        }
    }
}

/// A fully qualified id, or a local one resolved against `module`.
fn action_ref(module: &ModuleId, id: &str) -> Result<ActionId> {
    if id.contains(crate::artifact::ACTION_ID_SEPARATOR) {
        ActionId::parse(id).context(format!("Invalid action id `{}`", id))
    } else {
        Ok(ActionId::new(module, id))
    }
}

fn arguments(module: &ModuleId, args: &[ArgumentDef]) -> Result<Vec<Argument>> {
    args.iter().map(|arg| argument(module, arg)).collect()
}

fn argument(module: &ModuleId, arg: &ArgumentDef) -> Result<Argument> {
    Ok(match arg {
        ArgumentDef::Literal(literal) => Argument::Literal(literal.to_string()),
        ArgumentDef::Reference(ReferenceDef::Artifact(id)) => {
            Argument::Artifact(ArtifactReference::Unresolved(action_ref(module, id)?))
        }
        ArgumentDef::Reference(ReferenceDef::Account(index)) => {
            Argument::Account(AccountIndex(*index))
        }
        ArgumentDef::Reference(ReferenceDef::External(name)) => Argument::External(name.clone()),
        ArgumentDef::Reference(ReferenceDef::Address(address)) => {
            Argument::Artifact(ArtifactReference::Resolved(*address))
        }
        ArgumentDef::Reference(ReferenceDef::Encode(call)) => {
            Argument::Encoded(Box::new(EncodedCall {
                target: action_ref(module, &call.target)?,
                function: call.function.clone(),
                args: arguments(module, &call.args)?,
            }))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::BuildError, module::ActionKind};

    const PROXY_MODULE: &str = r#"
        [[module]]
        id = "LibraryModule"

        [[module.action]]
        kind = "library"
        id = "crypto"
        name = "Crypto"

        [[module]]
        id = "ProxyModule"
        uses = ["LibraryModule"]

        [[module.action]]
        kind = "contract"
        id = "vault"
        name = "Vault"
        libraries = { Crypto = "LibraryModule#crypto" }

        [[module.action]]
        kind = "contract"
        id = "proxy"
        name = "TransparentUpgradeableProxy"
        value = "1000"
        args = [
            { artifact = "vault" },
            { account = 1 },
            { encode = { target = "vault", function = "initialize", args = [{ external = "oracle" }, 1000, [1, 2]] } },
        ]

        [[module.action]]
        kind = "existing"
        id = "vaultProxy"
        name = "Vault"
        at = { artifact = "proxy" }

        [[module.action]]
        kind = "call"
        target = "vaultProxy"
        function = "setFee"
        args = ["30"]
        from = 1
        after = ["proxy"]
    "#;

    #[test]
    fn test_manifest_builds_modules() {
        let manifest = Manifest::from_toml(PROXY_MODULE).unwrap();
        assert_eq!(
            manifest.module_ids(),
            vec![ModuleId::from("LibraryModule"), ModuleId::from("ProxyModule")]
        );

        let registry = manifest.to_registry().unwrap();
        let module = registry.get(&"ProxyModule".into()).unwrap();
        assert_eq!(module.uses, vec![ModuleId::from("LibraryModule")]);
        assert_eq!(module.actions.len(), 4);
        assert_eq!(module.actions[3].id.as_str(), "ProxyModule#3");
        assert_eq!(module.actions[1].value, U256::from(1000));

        match &module.actions[1].kind {
            ActionKind::DeployContract { args, .. } => {
                assert_eq!(
                    args[0],
                    Argument::from(ActionId::parse("ProxyModule#vault").unwrap())
                );
                assert_eq!(args[1], Argument::Account(AccountIndex(1)));
                let Argument::Encoded(call) = &args[2] else {
                    panic!("expected an encoded call");
                };
                assert_eq!(call.args[0], Argument::External("oracle".into()));
                assert_eq!(call.args[1], Argument::Literal("1000".into()));
                assert_eq!(call.args[2], Argument::Literal("[1,2]".into()));
            }
            other => panic!("unexpected kind {other:?}"),
        }

        let deps: Vec<_> = module.actions[0]
            .dependencies()
            .into_iter()
            .map(|d| d.producer.to_string())
            .collect();
        assert_eq!(deps, vec!["LibraryModule#crypto"]);
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let err = Manifest::from_toml(
            r#"
            [[module]]
            id = "M"
            [[module.action]]
            kind = "call"
            function = "pause"
            "#,
        )
        .unwrap()
        .to_registry()
        .unwrap_err();
        assert!(format!("{:#}", err).contains("`target` is required"));
    }

    #[test]
    fn test_module_id_with_separator_is_rejected() {
        let err = Manifest::from_toml(
            r#"
            [[module]]
            id = "Token#v2"
            [[module.action]]
            kind = "library"
            name = "Crypto"
            "#,
        )
        .unwrap()
        .to_registry()
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<BuildError>(),
            Some(&BuildError::InvalidModuleId("Token#v2".into()))
        );
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(
            Manifest::from_toml(
                r#"
                [[module]]
                id = "M"
                [[module.action]]
                kind = "library"
                name = "Crypto"
                colour = "blue"
                "#,
            )
            .is_err()
        );
    }
}
