use faas_common::FunctionDefinition;

use super::{artifact_arg, extension_globs, BuildInstruction, RuntimeResolver};
use crate::{Error, Result};

const BINARY: &str = "bootstrap";

/// The handler is a package path; the built binary speaks the worker protocol itself.
pub struct GoResolver;

impl RuntimeResolver for GoResolver {
    fn name(&self) -> &'static str {
        "go"
    }

    fn matches(&self, runtime: &str) -> bool {
        runtime.starts_with("go")
    }

    fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction> {
        if def.handler_ref.trim().is_empty() {
            return Err(Error::HandlerUnresolved {
                function_id: def.function_id.clone(),
                handler: def.handler_ref.clone(),
                reason: "empty package path".to_string(),
            });
        }
        let package = if def.handler_ref.starts_with('.') || def.handler_ref.starts_with('/') {
            def.handler_ref.clone()
        } else {
            format!("./{}", def.handler_ref)
        };

        let src_root = def.src_root();
        let mut instruction = BuildInstruction::base(def, vec![artifact_arg(BINARY)])
            .default_build(vec![
                "go".to_string(),
                "build".to_string(),
                "-o".to_string(),
                artifact_arg(BINARY),
                package,
            ])
            .watch(extension_globs(&src_root, &["go", "mod", "sum"]));
        instruction
            .build_env
            .entry("CGO_ENABLED".to_string())
            .or_insert_with(|| "0".to_string());
        Ok(instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_path_is_relative() {
        let def = FunctionDefinition::new("worker", "cmd/worker", "go1.x", "/app");
        let instruction = GoResolver.resolve(&def).unwrap();
        let build = instruction.build_command.unwrap();
        assert_eq!(build.last().unwrap(), "./cmd/worker");
        assert_eq!(instruction.run_command, vec!["{artifact}/bootstrap".to_string()]);
        assert_eq!(instruction.build_env.get("CGO_ENABLED").unwrap(), "0");
    }
}
