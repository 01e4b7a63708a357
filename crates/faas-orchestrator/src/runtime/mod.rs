//! Runtime-specific resolution of a function definition into build instructions.
//!
//! Resolution is a pure mapping from `(runtime, handler)` to a [`BuildInstruction`]. The set of
//! resolvers is closed and selected by runtime tag prefix; adding a runtime means adding a
//! resolver to [`RuntimeRegistry::new`], nothing else.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use faas_common::FunctionDefinition;

use crate::{Error, Result};

mod go;
mod node;
mod python;
mod rust;

pub use go::GoResolver;
pub use node::NodeResolver;
pub use python::PythonResolver;
pub use rust::RustResolver;

/// Replaced with the versioned artifact directory when a build runs.
pub const ARTIFACT_PLACEHOLDER: &str = "{artifact}";

/// Directory under the project root that holds every function's artifacts.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// How to build and run one function. Recomputed on every definition change, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInstruction {
    pub function_id: String,
    pub runtime: String,
    /// Working directory for the build command.
    pub src_root: PathBuf,
    /// `None` when the runtime needs no compile step.
    pub build_command: Option<Vec<String>>,
    pub build_env: BTreeMap<String, String>,
    /// Files produced outside the artifact directory, copied in after a successful build.
    pub collect: Vec<PathBuf>,
    /// Bridge shims written into the artifact directory: (file name, contents).
    pub files: Vec<(String, &'static str)>,
    /// Command line that starts a worker against the built artifact.
    pub run_command: Vec<String>,
    /// Globs whose matches trigger a rebuild of this function until a build reports its inputs.
    pub watch_include: Vec<String>,
    /// The definition's own `buildOptions.watch`, absolute. Always watched.
    pub user_watch: Vec<String>,
    /// `<root>/artifacts/<functionID>`; each build writes a fresh subdirectory.
    pub out_dir: PathBuf,
}

impl BuildInstruction {
    /// Skeleton shared by every resolver: ids, directories, user overrides.
    pub(crate) fn base(def: &FunctionDefinition, run_command: Vec<String>) -> Self {
        let src_root = def.src_root();
        let mut watch_include: Vec<String> = def
            .build_options
            .watch
            .iter()
            .map(|pattern| absolute_pattern(&src_root, pattern))
            .collect();
        watch_include.sort();
        watch_include.dedup();

        Self {
            function_id: def.function_id.clone(),
            runtime: def.runtime.clone(),
            src_root,
            build_command: def.build_options.command.clone(),
            build_env: def.build_options.env.clone(),
            collect: Vec::new(),
            files: Vec::new(),
            run_command,
            user_watch: watch_include.clone(),
            watch_include,
            out_dir: def.root.join(ARTIFACTS_DIR).join(&def.function_id),
        }
    }

    pub(crate) fn watch(mut self, patterns: impl IntoIterator<Item = String>) -> Self {
        self.watch_include.extend(patterns);
        self.watch_include.sort();
        self.watch_include.dedup();
        self
    }

    /// Default build command, unless the definition overrides it.
    pub(crate) fn default_build(mut self, command: Vec<String>) -> Self {
        if self.build_command.is_none() {
            self.build_command = Some(command);
        }
        self
    }
}

pub trait RuntimeResolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tag match on the definition's runtime string, e.g. `nodejs18.x` or `python3.11`.
    fn matches(&self, runtime: &str) -> bool;

    fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction>;
}

#[derive(Clone)]
pub struct RuntimeRegistry {
    resolvers: Vec<Arc<dyn RuntimeResolver>>,
}

impl Default for RuntimeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self {
            resolvers: vec![
                Arc::new(NodeResolver),
                Arc::new(PythonResolver),
                Arc::new(GoResolver),
                Arc::new(RustResolver),
            ],
        }
    }

    pub fn resolver_for(&self, runtime: &str) -> Option<&Arc<dyn RuntimeResolver>> {
        self.resolvers.iter().find(|r| r.matches(runtime))
    }

    pub fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction> {
        let resolver = self
            .resolver_for(&def.runtime)
            .ok_or_else(|| Error::UnsupportedRuntime {
                function_id: def.function_id.clone(),
                runtime: def.runtime.clone(),
            })?;
        resolver.resolve(def)
    }
}

/// Splits `path/to/file.export` into (`path/to/file`, `export`).
pub(crate) fn split_handler(def: &FunctionDefinition) -> Result<(String, String)> {
    let (file, export) =
        def.handler_ref
            .rsplit_once('.')
            .ok_or_else(|| Error::HandlerUnresolved {
                function_id: def.function_id.clone(),
                handler: def.handler_ref.clone(),
                reason: "expected `path/to/file.export`".to_string(),
            })?;
    if file.is_empty() || export.is_empty() {
        return Err(Error::HandlerUnresolved {
            function_id: def.function_id.clone(),
            handler: def.handler_ref.clone(),
            reason: "empty file or export name".to_string(),
        });
    }
    Ok((file.to_string(), export.to_string()))
}

pub(crate) fn absolute_pattern(base: &Path, pattern: &str) -> String {
    if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        base.join(pattern).to_string_lossy().into_owned()
    }
}

/// `<src>/**/*.<ext>` for each extension.
pub(crate) fn extension_globs(src_root: &Path, extensions: &[&str]) -> Vec<String> {
    extensions
        .iter()
        .map(|ext| absolute_pattern(src_root, &format!("**/*.{ext}")))
        .collect()
}

pub(crate) fn artifact_arg(rest: &str) -> String {
    format!("{ARTIFACT_PLACEHOLDER}/{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_by_tag_prefix() {
        let registry = RuntimeRegistry::new();
        assert_eq!(registry.resolver_for("nodejs18.x").unwrap().name(), "node");
        assert_eq!(registry.resolver_for("node20").unwrap().name(), "node");
        assert_eq!(registry.resolver_for("python3.11").unwrap().name(), "python");
        assert_eq!(registry.resolver_for("go1.x").unwrap().name(), "go");
        assert_eq!(registry.resolver_for("provided.al2").unwrap().name(), "rust");
        assert!(registry.resolver_for("dotnet6").is_none());
    }

    #[test]
    fn test_unknown_runtime_is_rejected() {
        let def = FunctionDefinition::new("f", "Handler::Run", "dotnet6", "/app");
        let err = RuntimeRegistry::new().resolve(&def).unwrap_err();
        assert!(matches!(err, Error::UnsupportedRuntime { .. }));
    }

    #[test]
    fn test_split_handler() {
        let def = FunctionDefinition::new("f", "src/nested.dir/api.main", "python3.11", "/app");
        let (file, export) = split_handler(&def).unwrap();
        assert_eq!(file, "src/nested.dir/api");
        assert_eq!(export, "main");

        let bad = FunctionDefinition::new("f", "noexport", "python3.11", "/app");
        assert!(split_handler(&bad).is_err());
    }

    #[test]
    fn test_user_overrides_apply() {
        let mut def = FunctionDefinition::new("f", "src/api.handler", "python3.11", "/app");
        def.build_options.watch = vec!["shared/**/*.json".into()];
        def.build_options.command = Some(vec!["make".into(), "bundle".into()]);

        let instruction = BuildInstruction::base(&def, vec!["run".into()])
            .default_build(vec!["ignored".into()]);
        assert_eq!(instruction.build_command, Some(vec!["make".into(), "bundle".into()]));
        assert_eq!(instruction.watch_include, vec!["/app/shared/**/*.json".to_string()]);
        assert_eq!(instruction.user_watch, instruction.watch_include);
        assert_eq!(instruction.out_dir, PathBuf::from("/app/artifacts/f"));
    }
}
