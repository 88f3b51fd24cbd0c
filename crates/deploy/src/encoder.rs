//! Parameter and call encoding.
//!
//! Turns a compiled artifact's interface plus fully resolved arguments into the bytes sent
//! on-chain: constructor payloads (linked bytecode followed by the encoded constructor
//! arguments) and function calldata. Everything in here is pure.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{Function, JsonAbi, Param},
    primitives::{Address, Bytes},
};
use anyhow::Context;
use serde::Deserialize;
use thiserror::Error;

/// An argument whose artifact references have all been substituted.
///
/// There is no unresolved variant: encoding only happens once every
/// dependency of an action has completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedArgument {
    Literal(String),
    Address(Address),
    Bytes(Bytes),
}

/// Errors raised while encoding a payload.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("function `{0}` is not part of the interface")]
    UnknownFunction(String),

    #[error("`{function}` is overloaded ({}); use the full signature", .candidates.join(", "))]
    AmbiguousFunction {
        function: String,
        candidates: Vec<String>,
    },

    #[error("`{function}` takes {expected} argument(s), {got} given")]
    ArgumentCount {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("argument {index} (`{ty}`): cannot use `{value}`: {reason}")]
    Coerce {
        index: usize,
        ty: String,
        value: String,
        reason: String,
    },

    #[error("argument {index} (`{ty}`): expected {ty}, got {got}")]
    TypeMismatch {
        index: usize,
        ty: String,
        got: &'static str,
    },

    #[error(transparent)]
    Abi(#[from] alloy_core::dyn_abi::Error),

    #[error("artifact `{0}` has no bytecode (abstract contract or interface?)")]
    EmptyBytecode(String),

    #[error("invalid bytecode for `{contract}`: {reason}")]
    InvalidBytecode { contract: String, reason: String },

    #[error("library `{0}` is required by the bytecode but was not linked")]
    MissingLibrary(String),

    #[error("library `{0}` is linked but not referenced by the bytecode")]
    UnknownLibrary(String),
}

/// Location of a library placeholder inside creation bytecode, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LinkOffset {
    pub start: usize,
    pub length: usize,
}

/// A compiled contract or library, in the Hardhat artifact format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractArtifact {
    pub contract_name: String,
    #[serde(default)]
    pub source_name: String,
    pub abi: JsonAbi,
    /// Creation bytecode; hex with `__$…$__` placeholders where libraries are linked.
    pub bytecode: String,
    /// `source file -> library name -> offsets`.
    #[serde(default)]
    pub link_references: BTreeMap<String, BTreeMap<String, Vec<LinkOffset>>>,
}

impl ContractArtifact {
    /// Fully qualified name, `source:Contract`.
    pub fn qualified_name(&self) -> String {
        format!("{}:{}", self.source_name, self.contract_name)
    }

    /// Replace every library placeholder with the linked address.
    ///
    /// `libraries` may be keyed by short name (`Crypto`) or fully qualified name
    /// (`contracts/Crypto.sol:Crypto`).
    pub fn link(&self, libraries: &BTreeMap<String, Address>) -> Result<Vec<u8>, EncodeError> {
        let mut code = self
            .bytecode
            .trim_start_matches("0x")
            .to_ascii_lowercase()
            .into_bytes();
        if code.is_empty() {
            return Err(EncodeError::EmptyBytecode(self.contract_name.clone()));
        }

        let mut used = BTreeSet::new();
        for (source, libs) in &self.link_references {
            for (name, offsets) in libs {
                let qualified = format!("{}:{}", source, name);
                let (key, address) = libraries
                    .get_key_value(&qualified)
                    .or_else(|| libraries.get_key_value(name))
                    .ok_or_else(|| EncodeError::MissingLibrary(name.clone()))?;
                used.insert(key.clone());

                let replacement = hex::encode(address.as_slice()).into_bytes();
                for offset in offsets {
                    let range = offset
                        .start
                        .checked_mul(2)
                        .zip(offset.length.checked_mul(2))
                        .and_then(|(start, len)| Some(start..start.checked_add(len)?))
                        .filter(|range| {
                            range.end <= code.len() && range.len() == replacement.len()
                        })
                        .ok_or_else(|| EncodeError::InvalidBytecode {
                            contract: self.contract_name.clone(),
                            reason: format!(
                                "link offset {} (length {}) out of range",
                                offset.start, offset.length
                            ),
                        })?;
                    code[range].copy_from_slice(&replacement);
                }
            }
        }

        if let Some(extra) = libraries.keys().find(|key| !used.contains(*key)) {
            return Err(EncodeError::UnknownLibrary(extra.clone()));
        }

        hex::decode(&code).map_err(|e| EncodeError::InvalidBytecode {
            contract: self.contract_name.clone(),
            reason: e.to_string(),
        })
    }
}

/// Compiled artifacts, addressable by short or fully qualified name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    artifacts: HashMap<String, ContractArtifact>,
    short_names: HashMap<String, Vec<String>>,
}

impl ArtifactStore {
    pub fn insert(&mut self, artifact: ContractArtifact) {
        let qualified = artifact.qualified_name();
        let names = self
            .short_names
            .entry(artifact.contract_name.clone())
            .or_default();
        if !names.contains(&qualified) {
            names.push(qualified.clone());
        }
        self.artifacts.insert(qualified, artifact);
    }

    /// Look an artifact up by `Name` or `path/To.sol:Name`.
    ///
    /// A short name shared by several sources is ambiguous and yields `None`.
    pub fn get(&self, name: &str) -> Option<&ContractArtifact> {
        if name.contains(':') {
            return self.artifacts.get(name);
        }
        match self.short_names.get(name).map(Vec::as_slice) {
            Some([qualified]) => self.artifacts.get(qualified),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Load every artifact found below `dir`.
    ///
    /// Debug files (`*.dbg.json`), `build-info` and JSON files that are not artifacts are
    /// skipped.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut store = Self::default();
        store.load_recursive(dir)?;
        tracing::debug!(dir = %dir.display(), artifacts = store.len(), "Loaded contract artifacts");
        Ok(store)
    }

    fn load_recursive(&mut self, dir: &Path) -> anyhow::Result<()> {
        let entries = std::fs::read_dir(dir)
            .context(format!("Failed to read artifacts directory {}", dir.display()))?;

        for entry in entries {
            let path = entry.context("Failed to read directory entry")?.path();
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            if path.is_dir() {
                if file_name != "build-info" {
                    self.load_recursive(&path)?;
                }
                continue;
            }
            if !file_name.ends_with(".json") || file_name.ends_with(".dbg.json") {
                continue;
            }

            let content = std::fs::read_to_string(&path)
                .context(format!("Failed to read artifact {}", path.display()))?;
            match serde_json::from_str::<ContractArtifact>(&content) {
                Ok(artifact) => self.insert(artifact),
                Err(e) => {
                    tracing::trace!(path = %path.display(), err = %e, "Skipping non-artifact JSON file");
                }
            }
        }

        Ok(())
    }
}

/// Pick the function to call: by full signature when `name` contains `(`, otherwise by name
/// and arity.
pub fn select_function<'a>(
    abi: &'a JsonAbi,
    name: &str,
    arity: usize,
) -> Result<&'a Function, EncodeError> {
    if name.contains('(') {
        return abi
            .functions()
            .find(|f| f.signature() == name)
            .ok_or_else(|| EncodeError::UnknownFunction(name.to_string()));
    }

    let overloads = abi
        .function(name)
        .ok_or_else(|| EncodeError::UnknownFunction(name.to_string()))?;
    let matching: Vec<&Function> = overloads
        .iter()
        .filter(|f| f.inputs.len() == arity)
        .collect();

    match matching.as_slice() {
        [function] => Ok(*function),
        [] if overloads.len() == 1 => Err(EncodeError::ArgumentCount {
            function: name.to_string(),
            expected: overloads[0].inputs.len(),
            got: arity,
        }),
        [] => Err(EncodeError::UnknownFunction(format!(
            "{} with {} argument(s)",
            name, arity
        ))),
        candidates => Err(EncodeError::AmbiguousFunction {
            function: name.to_string(),
            candidates: candidates.iter().map(|f| f.signature()).collect(),
        }),
    }
}

/// Encode calldata (selector followed by arguments) for `function` of `abi`.
pub fn encode_call(
    abi: &JsonAbi,
    function: &str,
    args: &[ResolvedArgument],
) -> Result<Bytes, EncodeError> {
    let func = select_function(abi, function, args.len())?;
    let values = coerce_all(&func.name, &func.inputs, args)?;
    Ok(func.abi_encode_input(&values)?.into())
}

/// Encode a creation payload: linked bytecode followed by the constructor arguments.
pub fn encode_deployment(
    artifact: &ContractArtifact,
    libraries: &BTreeMap<String, Address>,
    args: &[ResolvedArgument],
) -> Result<Bytes, EncodeError> {
    let mut payload = artifact.link(libraries)?;

    match &artifact.abi.constructor {
        Some(constructor) => {
            let values = coerce_all("constructor", &constructor.inputs, args)?;
            payload.extend(constructor.abi_encode_input(&values)?);
        }
        None if !args.is_empty() => {
            return Err(EncodeError::ArgumentCount {
                function: "constructor".to_string(),
                expected: 0,
                got: args.len(),
            });
        }
        None => {}
    }

    Ok(payload.into())
}

fn coerce_all(
    function: &str,
    params: &[Param],
    args: &[ResolvedArgument],
) -> Result<Vec<DynSolValue>, EncodeError> {
    if params.len() != args.len() {
        return Err(EncodeError::ArgumentCount {
            function: function.to_string(),
            expected: params.len(),
            got: args.len(),
        });
    }

    params
        .iter()
        .zip(args)
        .enumerate()
        .map(|(index, (param, arg))| coerce(index, param, arg))
        .collect()
}

fn coerce(index: usize, param: &Param, arg: &ResolvedArgument) -> Result<DynSolValue, EncodeError> {
    let ty: DynSolType = param.resolve()?;

    match (arg, &ty) {
        (ResolvedArgument::Literal(_), ty) if holds_address(ty) => Err(EncodeError::TypeMismatch {
            index,
            ty: ty.sol_type_name().to_string(),
            got: "a literal; pass addresses as `{ address = .. }` or a reference",
        }),
        (ResolvedArgument::Literal(value), _) => {
            ty.coerce_str(value).map_err(|e| EncodeError::Coerce {
                index,
                ty: ty.sol_type_name().to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
        }
        (ResolvedArgument::Address(address), DynSolType::Address) => {
            Ok(DynSolValue::Address(*address))
        }
        (ResolvedArgument::Bytes(bytes), DynSolType::Bytes) => {
            Ok(DynSolValue::Bytes(bytes.to_vec()))
        }
        (ResolvedArgument::Address(_), _) => Err(EncodeError::TypeMismatch {
            index,
            ty: ty.sol_type_name().to_string(),
            got: "an address",
        }),
        (ResolvedArgument::Bytes(_), _) => Err(EncodeError::TypeMismatch {
            index,
            ty: ty.sol_type_name().to_string(),
            got: "encoded calldata",
        }),
    }
}

/// Addresses only enter payloads through typed arguments, never through literals.
fn holds_address(ty: &DynSolType) -> bool {
    match ty {
        DynSolType::Address | DynSolType::Function => true,
        DynSolType::Array(inner) | DynSolType::FixedArray(inner, _) => holds_address(inner),
        DynSolType::Tuple(types) => types.iter().any(holds_address),
        _ => false,
    }
}
