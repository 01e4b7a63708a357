use faas_common::FunctionDefinition;

use super::{artifact_arg, extension_globs, split_handler, BuildInstruction, RuntimeResolver};
use crate::builder::METAFILE;
use crate::{Error, Result};

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs"];
const WATCH_EXTENSIONS: &[&str] = &["ts", "tsx", "mts", "cts", "js", "jsx", "mjs", "cjs", "json"];

const BRIDGE: &str = "bridge.cjs";
const BUNDLE: &str = "handler.cjs";

pub struct NodeResolver;

impl RuntimeResolver for NodeResolver {
    fn name(&self) -> &'static str {
        "node"
    }

    fn matches(&self, runtime: &str) -> bool {
        runtime.starts_with("node")
    }

    fn resolve(&self, def: &FunctionDefinition) -> Result<BuildInstruction> {
        let (file, export) = split_handler(def)?;
        let src_root = def.src_root();
        let entry = SOURCE_EXTENSIONS
            .iter()
            .map(|ext| src_root.join(format!("{file}.{ext}")))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::HandlerUnresolved {
                function_id: def.function_id.clone(),
                handler: def.handler_ref.clone(),
                reason: format!("no source file for `{file}` under {}", src_root.display()),
            })?;

        let mut instruction = BuildInstruction::base(
            def,
            vec![
                "node".to_string(),
                artifact_arg(BRIDGE),
                artifact_arg(BUNDLE),
                export,
            ],
        )
        .default_build(vec![
            "esbuild".to_string(),
            entry.to_string_lossy().into_owned(),
            "--bundle".to_string(),
            "--platform=node".to_string(),
            "--format=cjs".to_string(),
            "--sourcemap".to_string(),
            format!("--outfile={}", artifact_arg(BUNDLE)),
            format!("--metafile={}", artifact_arg(METAFILE)),
        ])
        .watch(extension_globs(&src_root, WATCH_EXTENSIONS));
        instruction
            .files
            .push((BRIDGE.to_string(), include_str!("../../shims/bridge.cjs")));
        Ok(instruction)
    }
}
