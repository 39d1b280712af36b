//! The compiler service: source text in, loadable module out.

use std::collections::VecDeque;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use rustc_hash::{FxHashSet, FxHasher};

use super::diagnostics::DiagnosticMapper;
use super::runtime::{RUNTIME_CRATE, RuntimeLibrary};
use super::toolchain::Toolchain;
use super::types::{CompilationInput, CompilationResult, CompiledModule, CompilerConfig};
use crate::error::{Error, Result};
use crate::script::Reference;

/// Name the wrapped source is compiled under. Panic locations refer to it.
pub const SOURCE_FILE: &str = "script.rs";

/// Compiles scripts with rustc.
///
/// Holds no per-compile state besides a small cache of finished modules,
/// so one instance is shared by every environment and may compile
/// concurrently.
#[derive(Debug)]
pub struct CompilerService {
    config: CompilerConfig,
    toolchain: Toolchain,
    runtime: RuntimeLibrary,
    cache: Mutex<VecDeque<(String, CompilationResult)>>,
}

/// A reference resolved to an `--extern` argument.
struct ResolvedReference {
    crate_name: String,
    path: PathBuf,
}

impl CompilerService {
    /// Create a compiler service, detecting rustc.
    pub fn new(config: CompilerConfig) -> Result<Self> {
        let toolchain = Toolchain::detect()?;
        Ok(Self::with_toolchain(config, toolchain))
    }

    pub fn with_toolchain(config: CompilerConfig, toolchain: Toolchain) -> Self {
        let runtime = RuntimeLibrary::new(&config.build_dir);
        Self {
            config,
            toolchain,
            runtime,
            cache: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Compile source into a module.
    ///
    /// Ordinary compile errors come back as a failed result. `Err` is
    /// reserved for malformed input and a broken toolchain.
    pub fn compile(&self, input: &CompilationInput) -> Result<CompilationResult> {
        let references = dedup_references(&input.references)?;
        let runtime_rlib = self.runtime.ensure(&self.toolchain)?;
        let name = self.module_name(input, &references);
        if let Some(cached) = self.cached(&name) {
            tracing::debug!("Reusing compiled module {}", name);
            return Ok(cached);
        }

        let scratch_root = self.config.build_dir.join("scratch");
        fs::create_dir_all(&scratch_root)?;
        let scratch = tempfile::Builder::new()
            .prefix("compile-")
            .tempdir_in(&scratch_root)?;

        fs::write(scratch.path().join(SOURCE_FILE), &input.code)?;
        let resolved = Self::resolve_references(scratch.path(), &references)?;

        let output_name = input.target.file_name();
        let mut cmd = self.rustc_command(input, &name, scratch.path(), &output_name);
        cmd.arg("-L")
            .arg(format!("dependency={}", parent_dir(&runtime_rlib).display()))
            .arg("--extern")
            .arg(format!("{}={}", RUNTIME_CRATE, runtime_rlib.display()));
        for reference in &resolved {
            cmd.arg("-L")
                .arg(format!("dependency={}", parent_dir(&reference.path).display()))
                .arg("--extern")
                .arg(format!("{}={}", reference.crate_name, reference.path.display()));
        }

        tracing::debug!("Compiling {}: {:?}", name, cmd);

        let output = match cmd.output() {
            Ok(output) => output,
            Err(e) => {
                return Ok(CompilationResult::failed(format!(
                    "Failed to run rustc: {}",
                    e
                )));
            }
        };

        let mapper =
            DiagnosticMapper::new(input.user_lines.clone()).with_lifted_lines(input.lifted_lines);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = mapper.parse_rustc_output(&stderr);

        let module_path = scratch.path().join(&output_name);
        if !output.status.success() || !module_path.exists() {
            if diagnostics.is_empty() {
                return Ok(CompilationResult::failed(format!(
                    "rustc failed without diagnostics: {}",
                    stderr.trim()
                )));
            }
            return Ok(CompilationResult {
                success: false,
                module: None,
                diagnostics,
            });
        }

        let bytes = fs::read(&module_path)?;
        tracing::debug!("Compiled {} ({} bytes)", name, bytes.len());

        let result = CompilationResult {
            success: true,
            module: Some(CompiledModule {
                name: name.clone(),
                bytes: Arc::new(bytes),
                user_start_line: input.user_lines.as_ref().map(|lines| lines.start),
            }),
            diagnostics,
        };
        self.remember(name, &result);
        Ok(result)
    }

    fn cached(&self, name: &str) -> Option<CompilationResult> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .iter()
            .find(|(cached, _)| cached == name)
            .map(|(_, result)| result.clone())
    }

    fn remember(&self, name: String, result: &CompilationResult) {
        let capacity = self.config.module_cache_size;
        if capacity == 0 {
            return;
        }
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.retain(|(cached, _)| *cached != name);
        while cache.len() >= capacity {
            cache.pop_front();
        }
        cache.push_back((name, result.clone()));
    }

    fn rustc_command(
        &self,
        input: &CompilationInput,
        name: &str,
        scratch: &Path,
        output_name: &str,
    ) -> Command {
        let mut cmd = self.toolchain.command();
        cmd.current_dir(scratch)
            .arg(SOURCE_FILE)
            .arg("--crate-name=script")
            .arg(format!("--crate-type={}", input.target.crate_type()))
            .arg(format!("--edition={}", input.edition))
            .arg("--error-format=json")
            .arg(format!("-Copt-level={}", input.optimization.opt_level()))
            .arg(format!("-Cmetadata={}", name))
            .arg(format!("--remap-path-prefix={}=/scriptpad", scratch.display()))
            .arg("-o")
            .arg(output_name);

        if self.config.debug_info {
            cmd.arg("-Cdebuginfo=2");
        }

        for flag in &self.config.extra_rustc_flags {
            cmd.arg(flag);
        }

        cmd
    }

    /// Module identity: same input, same toolchain, same name.
    fn module_name(&self, input: &CompilationInput, references: &[&Reference]) -> String {
        let mut hasher = FxHasher::default();
        input.code.hash(&mut hasher);
        input.edition.hash(&mut hasher);
        input.target.hash(&mut hasher);
        input.optimization.hash(&mut hasher);
        input.user_lines.hash(&mut hasher);
        input.lifted_lines.hash(&mut hasher);
        self.config.debug_info.hash(&mut hasher);
        self.config.extra_rustc_flags.hash(&mut hasher);
        self.toolchain.version().hash(&mut hasher);
        for reference in references {
            match reference {
                Reference::File { path, crate_name } => {
                    path.hash(&mut hasher);
                    crate_name.hash(&mut hasher);
                    // A rebuilt file is a different input.
                    if let Ok(meta) = fs::metadata(path) {
                        meta.len().hash(&mut hasher);
                        meta.modified().ok().hash(&mut hasher);
                    }
                }
                Reference::Image { crate_name, bytes } => {
                    crate_name.hash(&mut hasher);
                    bytes.as_slice().hash(&mut hasher);
                }
            }
        }
        format!("script-{:016x}", hasher.finish())
    }

    /// Write in-memory images next to the source and pick crate names.
    fn resolve_references(
        scratch: &Path,
        references: &[&Reference],
    ) -> Result<Vec<ResolvedReference>> {
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            let crate_name = reference.crate_name().ok_or_else(|| {
                Error::Compilation(format!("cannot derive a crate name for {:?}", reference))
            })?;
            let path = match reference {
                Reference::File { path, .. } => path.clone(),
                Reference::Image { bytes, .. } => {
                    let dir = scratch.join("refs");
                    fs::create_dir_all(&dir)?;
                    let path = dir.join(format!("lib{}.rlib", crate_name));
                    fs::write(&path, bytes.as_slice())?;
                    path
                }
            };
            resolved.push(ResolvedReference { crate_name, path });
        }
        Ok(resolved)
    }
}

/// Drop duplicate references, keeping the first occurrence.
///
/// Files are compared by path, images by crate name.
fn dedup_references(references: &[Reference]) -> Result<Vec<&Reference>> {
    let mut seen_paths = FxHashSet::default();
    let mut seen_images = FxHashSet::default();
    let mut unique = Vec::with_capacity(references.len());

    for reference in references {
        let first = match reference {
            Reference::File { path, .. } => seen_paths.insert(path.as_path()),
            Reference::Image { crate_name, .. } => {
                if !is_crate_name(crate_name) {
                    return Err(Error::Compilation(format!(
                        "invalid crate name for reference image: '{}'",
                        crate_name
                    )));
                }
                seen_images.insert(crate_name.as_str())
            }
        };
        if first {
            unique.push(reference);
        }
    }

    Ok(unique)
}

fn is_crate_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new("."))
}
