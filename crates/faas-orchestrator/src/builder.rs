//! The bundler seam: turns a [`BuildInstruction`] into a runnable artifact directory.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::runtime::{BuildInstruction, ARTIFACT_PLACEHOLDER};
use crate::{Error, Result};

/// Upper bound on compiler output lines carried into a `build.failed` event.
const MAX_ERROR_LINES: usize = 50;
/// esbuild input graph; once present its `inputs` become the function's watch set.
pub const METAFILE: &str = "meta.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Versioned directory this build wrote; never rewritten afterwards.
    pub artifact_path: PathBuf,
    /// Run command with the artifact placeholder substituted.
    pub command: Vec<String>,
    /// Extra source files the bundler reported reading, as absolute paths.
    pub inputs: Vec<PathBuf>,
}

#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, instruction: &BuildInstruction) -> Result<BuildOutput>;
}

/// Runs the instruction's build command as a child process.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    #[instrument(skip(self, instruction), fields(function_id = %instruction.function_id))]
    async fn build(&self, instruction: &BuildInstruction) -> Result<BuildOutput> {
        let build_id = Uuid::new_v4().simple().to_string();
        let artifact_path = instruction.out_dir.join(&build_id);
        fs::create_dir_all(&artifact_path).await?;

        match populate(instruction, &artifact_path).await {
            Ok(inputs) => {
                info!(artifact = %artifact_path.display(), "Build complete");
                Ok(BuildOutput {
                    command: substitute(&instruction.run_command, &artifact_path),
                    artifact_path,
                    inputs,
                })
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&artifact_path).await {
                    debug!(error = %cleanup, "Failed to remove partial artifact");
                }
                Err(e)
            }
        }
    }
}

async fn populate(instruction: &BuildInstruction, artifact_path: &Path) -> Result<Vec<PathBuf>> {
    for (name, contents) in &instruction.files {
        fs::write(artifact_path.join(name), contents).await?;
    }

    if let Some(command) = &instruction.build_command {
        let argv = substitute(command, artifact_path);
        run(instruction, &argv).await?;
    }

    for source in &instruction.collect {
        let name = source.file_name().ok_or_else(|| Error::BuildFailed {
            function_id: instruction.function_id.clone(),
            errors: vec![format!("cannot collect {}", source.display())],
        })?;
        fs::copy(source, artifact_path.join(name))
            .await
            .map_err(|e| Error::BuildFailed {
                function_id: instruction.function_id.clone(),
                errors: vec![format!("missing build output {}: {e}", source.display())],
            })?;
    }

    Ok(read_metafile_inputs(&artifact_path.join(METAFILE), &instruction.src_root).await)
}

async fn run(instruction: &BuildInstruction, argv: &[String]) -> Result<()> {
    let (program, args) = argv.split_first().ok_or_else(|| Error::BuildFailed {
        function_id: instruction.function_id.clone(),
        errors: vec!["empty build command".to_string()],
    })?;
    debug!(program = %program, ?args, cwd = %instruction.src_root.display(), "Running build command");

    let output = Command::new(program)
        .args(args)
        .current_dir(&instruction.src_root)
        .envs(&instruction.build_env)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| Error::BuildFailed {
            function_id: instruction.function_id.clone(),
            errors: vec![format!("failed to start `{program}`: {e}")],
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let mut errors: Vec<String> = source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(MAX_ERROR_LINES)
        .map(str::to_string)
        .collect();
    if errors.is_empty() {
        errors.push(format!("`{program}` exited with {}", output.status));
    }
    warn!(status = %output.status, "Build command failed");
    Err(Error::BuildFailed {
        function_id: instruction.function_id.clone(),
        errors,
    })
}

pub(crate) fn substitute(argv: &[String], artifact_path: &Path) -> Vec<String> {
    let artifact = artifact_path.to_string_lossy();
    argv.iter()
        .map(|arg| arg.replace(ARTIFACT_PLACEHOLDER, &artifact))
        .collect()
}

#[derive(Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, serde_json::Value>,
}

/// Input files listed in an esbuild metafile, resolved against the build's working directory.
async fn read_metafile_inputs(path: &Path, cwd: &Path) -> Vec<PathBuf> {
    let Ok(raw) = fs::read(path).await else {
        return Vec::new();
    };
    match serde_json::from_slice::<Metafile>(&raw) {
        Ok(meta) => meta
            .inputs
            .into_keys()
            .filter(|input| !input.contains("node_modules") && !input.contains(':'))
            .map(|input| normalize(&cwd.join(input)))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unreadable metafile");
            Vec::new()
        }
    }
}

/// Lexically resolves `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Removes every build of a function except `keep`.
pub async fn prune_artifacts(out_dir: &Path, keep: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match fs::read_dir(out_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == keep || !entry.file_type().await?.is_dir() {
            continue;
        }
        fs::remove_dir_all(&path).await?;
        removed += 1;
    }
    if removed > 0 {
        debug!(out_dir = %out_dir.display(), removed, "Pruned stale artifacts");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::FunctionDefinition;
    use tempfile::tempdir;

    fn instruction(root: &Path, build: Option<Vec<&str>>) -> BuildInstruction {
        let def = FunctionDefinition::new("api", "src/api.handler", "python3.11", root);
        let mut instruction = BuildInstruction::base(&def, vec!["run".into(), "{artifact}/x".into()]);
        instruction.build_command = build.map(|argv| argv.into_iter().map(String::from).collect());
        instruction
    }

    #[test]
    fn test_substitute_placeholder() {
        let argv = vec!["node".to_string(), "{artifact}/bridge.cjs".to_string()];
        assert_eq!(
            substitute(&argv, Path::new("/a/b")),
            vec!["node".to_string(), "/a/b/bridge.cjs".to_string()]
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize(Path::new("/app/src/../shared/./util.ts")),
            PathBuf::from("/app/shared/util.ts")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_build_writes_versioned_dir() {
        let dir = tempdir().unwrap();
        let mut instr = instruction(dir.path(), Some(vec!["sh", "-c", "echo built > {artifact}/out.txt"]));
        instr.files.push(("shim.txt".into(), "shim"));

        let output = CommandBuilder::new().build(&instr).await.unwrap();
        assert!(output.artifact_path.starts_with(dir.path().join("artifacts/api")));
        assert_eq!(
            fs::read_to_string(output.artifact_path.join("out.txt")).await.unwrap().trim(),
            "built"
        );
        assert!(output.artifact_path.join("shim.txt").is_file());
        assert_eq!(output.command[1], format!("{}/x", output.artifact_path.display()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_build_reports_stderr_and_cleans_up() {
        let dir = tempdir().unwrap();
        let instr = instruction(dir.path(), Some(vec!["sh", "-c", "echo 'syntax error at line 3' >&2; exit 2"]));

        let err = CommandBuilder::new().build(&instr).await.unwrap_err();
        assert_eq!(err.into_build_errors(), vec!["syntax error at line 3".to_string()]);

        let mut entries = std::fs::read_dir(dir.path().join("artifacts/api")).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_missing_tool_is_build_failure() {
        let dir = tempdir().unwrap();
        let instr = instruction(dir.path(), Some(vec!["definitely-not-a-bundler-7f3a"]));
        assert!(matches!(
            CommandBuilder::new().build(&instr).await,
            Err(Error::BuildFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_metafile_inputs_and_prune() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("artifacts/api");
        let keep = out.join("new");
        std::fs::create_dir_all(out.join("old")).unwrap();
        std::fs::create_dir_all(&keep).unwrap();
        std::fs::write(
            keep.join(METAFILE),
            r#"{"inputs":{"src/api.ts":{},"../shared/db.ts":{},"node_modules/x/index.js":{}}}"#,
        )
        .unwrap();

        let inputs = read_metafile_inputs(&keep.join(METAFILE), Path::new("/app/fn")).await;
        assert_eq!(
            inputs,
            vec![PathBuf::from("/app/shared/db.ts"), PathBuf::from("/app/fn/src/api.ts")]
        );

        assert_eq!(prune_artifacts(&out, &keep).await.unwrap(), 1);
        assert!(keep.is_dir());
        assert!(!out.join("old").exists());
    }
}
