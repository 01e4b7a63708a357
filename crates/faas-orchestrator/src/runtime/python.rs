use faas_common::FunctionDefinition;

use super::{artifact_arg, extension_globs, split_handler, BuildInstruction, RuntimeResolver};
use crate::{Error, Result};

const BRIDGE: &str = "bridge.py";

/// Python runs straight from source; the artifact only carries the bridge shim.
pub struct PythonResolver;

impl RuntimeResolver for PythonResolver {
    fn name(&self) -> &'static str {
        "python"
    }

    fn matches(&self, runtime: &str) -> bool {
        runtime.starts_with("python")
    }

    fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction> {
        let (file, export) = split_handler(def)?;
        let src_root = def.src_root();
        if !src_root.join(format!("{file}.py")).is_file() {
            return Err(Error::HandlerUnresolved {
                function_id: def.function_id.clone(),
                handler: def.handler_ref.clone(),
                reason: format!("{file}.py not found under {}", src_root.display()),
            });
        }
        let module = file.trim_start_matches("./").replace('/', ".");

        let mut instruction = BuildInstruction::base(
            def,
            vec![
                "python3".to_string(),
                "-u".to_string(),
                artifact_arg(BRIDGE),
                src_root.to_string_lossy().into_owned(),
                module,
                export,
            ],
        )
        .watch(extension_globs(&src_root, &["py"]));
        instruction
            .files
            .push((BRIDGE.to_string(), include_str!("../../shims/bridge.py")));
        Ok(instruction)
    }
}
