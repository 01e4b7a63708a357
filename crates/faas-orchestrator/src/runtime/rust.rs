use faas_common::FunctionDefinition;

use super::{absolute_pattern, artifact_arg, BuildInstruction, RuntimeResolver};
use crate::store::STATE_DIR;
use crate::{Error, Result};

/// The handler names a binary target; the built binary speaks the worker protocol itself.
pub struct RustResolver;

impl RuntimeResolver for RustResolver {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn matches(&self, runtime: &str) -> bool {
        runtime.starts_with("rust") || runtime.starts_with("provided")
    }

    fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction> {
        let binary = def.handler_ref.trim();
        if binary.is_empty() || binary.contains('/') {
            return Err(Error::HandlerUnresolved {
                function_id: def.function_id.clone(),
                handler: def.handler_ref.clone(),
                reason: "expected a binary target name".to_string(),
            });
        }

        // Shared across builds so incremental compilation survives versioned artifact dirs.
        let target_dir = def.root.join(STATE_DIR).join("cargo-target");
        let src_root = def.src_root();
        let mut instruction = BuildInstruction::base(def, vec![artifact_arg(binary)])
            .default_build(vec![
                "cargo".to_string(),
                "build".to_string(),
                "--release".to_string(),
                "--bin".to_string(),
                binary.to_string(),
                "--target-dir".to_string(),
                target_dir.to_string_lossy().into_owned(),
            ])
            .watch([
                absolute_pattern(&src_root, "**/*.rs"),
                absolute_pattern(&src_root, "**/Cargo.toml"),
            ]);
        instruction
            .collect
            .push(target_dir.join("release").join(binary));
        Ok(instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_binary_is_collected_into_artifact() {
        let def = FunctionDefinition::new("api", "api-handler", "provided.al2", "/app");
        let instruction = RustResolver.resolve(&def).unwrap();
        assert_eq!(
            instruction.collect,
            vec![PathBuf::from("/app/.faas-dev/cargo-target/release/api-handler")]
        );
        assert_eq!(instruction.run_command, vec!["{artifact}/api-handler".to_string()]);
    }

    #[test]
    fn test_path_like_handler_is_rejected() {
        let def = FunctionDefinition::new("api", "src/main.rs", "rust", "/app");
        assert!(RustResolver.resolve(&def).is_err());
    }
}
