//! Scripts, their run configuration, and per-run options.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compile::dylib_extension;

/// Unique identifier for a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScriptId(Uuid);

impl ScriptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScriptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScriptId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for one run of a script.
///
/// Output and completion messages carry it so events from a superseded run
/// can be recognized and discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How a snippet is turned into a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    /// A single expression. Declared but not supported.
    Expression,
    /// A block of statements run as the body of a generated entry function.
    #[default]
    Statements,
    /// A complete crate that defines `fn main()`.
    Program,
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScriptKind::Expression => "expression",
            ScriptKind::Statements => "statements",
            ScriptKind::Program => "program",
        };
        f.write_str(name)
    }
}

impl FromStr for ScriptKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expression" => Ok(ScriptKind::Expression),
            "statements" => Ok(ScriptKind::Statements),
            "program" => Ok(ScriptKind::Program),
            other => Err(format!("unknown script kind: {}", other)),
        }
    }
}

/// Target language edition the script is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Edition {
    #[serde(rename = "2015")]
    E2015,
    #[serde(rename = "2018")]
    E2018,
    #[default]
    #[serde(rename = "2021")]
    E2021,
    #[serde(rename = "2024")]
    E2024,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::E2015 => "2015",
            Edition::E2018 => "2018",
            Edition::E2021 => "2021",
            Edition::E2024 => "2024",
        }
    }
}

impl fmt::Display for Edition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "2015" => Ok(Edition::E2015),
            "2018" => Ok(Edition::E2018),
            "2021" => Ok(Edition::E2021),
            "2024" => Ok(Edition::E2024),
            other => Err(format!("unknown edition: {}", other)),
        }
    }
}

/// A compiled library the script links against.
///
/// The engine does not resolve these; callers hand them in ready-made.
#[derive(Debug, Clone)]
pub enum Reference {
    /// An rlib or dylib on disk.
    File {
        path: PathBuf,
        /// Name used in `--extern`. Derived from the file name when absent.
        crate_name: Option<String>,
    },
    /// An rlib held in memory.
    Image {
        crate_name: String,
        bytes: Arc<Vec<u8>>,
    },
}

impl Reference {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Reference::File {
            path: path.into(),
            crate_name: None,
        }
    }

    pub fn image(crate_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Reference::Image {
            crate_name: crate_name.into(),
            bytes: Arc::new(bytes),
        }
    }

    /// Crate name this reference is bound to.
    ///
    /// `libserde_json-1a2b3c.rlib` becomes `serde_json`.
    pub fn crate_name(&self) -> Option<String> {
        match self {
            Reference::File {
                crate_name: Some(name),
                ..
            } => Some(name.clone()),
            Reference::File { path, .. } => {
                let stem = path.file_stem()?.to_str()?;
                let stem = stem.strip_prefix("lib").unwrap_or(stem);
                let name = stem.split('-').next().unwrap_or(stem);
                (!name.is_empty()).then(|| name.to_string())
            }
            Reference::Image { crate_name, .. } => Some(crate_name.clone()),
        }
    }

    fn hash_into(&self, hasher: &mut FxHasher) {
        match self {
            Reference::File { path, crate_name } => {
                0u8.hash(hasher);
                path.hash(hasher);
                crate_name.hash(hasher);
            }
            Reference::Image { crate_name, bytes } => {
                1u8.hash(hasher);
                crate_name.hash(hasher);
                bytes.as_slice().hash(hasher);
            }
        }
    }
}

/// Run configuration attached to a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptConfig {
    pub kind: ScriptKind,
    /// Paths turned into `use` declarations, e.g. `std::collections::HashMap`.
    pub namespaces: Vec<String>,
    pub edition: Edition,
    pub references: Vec<Reference>,
    /// Extra directories whose dylibs are loaded before the module.
    pub probing_paths: Vec<PathBuf>,
}

impl ScriptConfig {
    pub fn with_kind(mut self, kind: ScriptKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespaces.push(namespace.into());
        self
    }

    pub fn with_edition(mut self, edition: Edition) -> Self {
        self.edition = edition;
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.references.push(reference);
        self
    }

    pub fn with_probing_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.probing_paths.push(path.into());
        self
    }

    /// Directories to preload dylibs from for a run.
    ///
    /// The configured paths come first, then the directory of every dylib
    /// file reference, each listed once.
    pub fn resolve_probing_paths(&self, additional: &[Reference]) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = Vec::new();
        let dylib_dirs = self
            .references
            .iter()
            .chain(additional)
            .filter_map(|reference| match reference {
                Reference::File { path, .. }
                    if path.extension().and_then(|e| e.to_str()) == Some(dylib_extension()) =>
                {
                    path.parent().map(Path::to_path_buf)
                }
                _ => None,
            });
        for path in self.probing_paths.iter().cloned().chain(dylib_dirs) {
            if !path.as_os_str().is_empty() && !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Hash of the settings that require a fresh script host when changed.
    pub fn host_fingerprint(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.edition.hash(&mut hasher);
        for reference in &self.references {
            reference.hash_into(&mut hasher);
        }
        hasher.finish()
    }
}

/// A user-authored snippet plus its run configuration.
#[derive(Debug, Clone)]
pub struct Script {
    id: ScriptId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub code: String,
    pub config: ScriptConfig,
    /// Whether the code changed since it was last saved.
    pub dirty: bool,
}

impl Script {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: ScriptId::new(),
            name: name.into(),
            path: None,
            code: code.into(),
            config: ScriptConfig::default(),
            dirty: false,
        }
    }

    pub fn with_config(mut self, config: ScriptConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    /// Replace the code, marking the script dirty when it changed.
    pub fn update_code(&mut self, code: impl Into<String>) {
        let code = code.into();
        if code != self.code {
            self.code = code;
            self.dirty = true;
        }
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }
}

/// Options for a single run. Built fresh per invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Code to run instead of the script's own (e.g. a selection).
    pub code_override: Option<String>,
    /// Extra source fragments merged into the program.
    pub additional_code: Vec<String>,
    /// Extra references merged into the compilation.
    pub additional_references: Vec<Reference>,
}

impl RunOptions {
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code_override = Some(code.into());
        self
    }

    pub fn with_additional_code(mut self, fragment: impl Into<String>) -> Self {
        self.additional_code.push(fragment.into());
        self
    }

    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.additional_references.push(reference);
        self
    }
}
