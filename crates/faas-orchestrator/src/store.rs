//! Append-only record of the functions the resource graph declares.
//!
//! One JSON object per line in `<root>/.faas-dev/functions.jsonl`. The synthesis engine appends,
//! the dev session reads at bootstrap. A torn final line (crash mid-append) only loses that one
//! record: unparsable lines are skipped, never fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use faas_common::FunctionDefinition;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::Result;

pub const STATE_DIR: &str = ".faas-dev";
const STORE_FILE: &str = "functions.jsonl";

#[derive(Debug, Clone, Default)]
pub struct FunctionStore;

impl FunctionStore {
    pub fn new() -> Self {
        Self
    }

    pub fn path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(STORE_FILE)
    }

    /// Writes one record under `def.root`.
    pub async fn append(&self, def: &FunctionDefinition) -> Result<()> {
        let path = Self::path(&def.root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_vec(def).map_err(faas_common::FaasError::from)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(function_id = %def.function_id, path = %path.display(), "Appended function definition");
        Ok(())
    }

    /// Every parsable record for `root`, in append order.
    pub async fn read(&self, root: &Path) -> Result<Vec<FunctionDefinition>> {
        let path = Self::path(root);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut defs = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FunctionDefinition>(line) {
                Ok(def) => defs.push(def),
                Err(e) => {
                    warn!(line = index + 1, error = %e, path = %path.display(), "Skipping malformed function record");
                }
            }
        }
        Ok(defs)
    }

    /// Latest record per function id; a redeclared function replaces its earlier record.
    pub async fn current(&self, root: &Path) -> Result<Vec<FunctionDefinition>> {
        let mut order = Vec::new();
        let mut latest: HashMap<String, FunctionDefinition> = HashMap::new();
        for def in self.read(root).await? {
            if !latest.contains_key(&def.function_id) {
                order.push(def.function_id.clone());
            }
            latest.insert(def.function_id.clone(), def);
        }
        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    pub async fn reset(&self, root: &Path) -> Result<()> {
        let path = Self::path(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, b"").await?;
        info!(path = %path.display(), "Function store reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn def(root: &Path, id: &str, handler: &str) -> FunctionDefinition {
        FunctionDefinition::new(id, handler, "nodejs18.x", root)
    }

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let store = FunctionStore::new();

        store.append(&def(dir.path(), "api", "src/api.handler")).await.unwrap();
        store.append(&def(dir.path(), "cron", "src/cron.run")).await.unwrap();

        let defs = store.read(dir.path()).await.unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].function_id, "api");
        assert_eq!(defs[1].handler_ref, "src/cron.run");
    }

    #[tokio::test]
    async fn test_missing_store_reads_empty() {
        let dir = tempdir().unwrap();
        assert!(FunctionStore::new().read(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_torn_final_line_is_skipped() {
        let dir = tempdir().unwrap();
        let store = FunctionStore::new();
        store.append(&def(dir.path(), "api", "src/api.handler")).await.unwrap();

        let path = FunctionStore::path(dir.path());
        let mut contents = fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"functionID\":\"half\",\"handlerR");
        fs::write(&path, contents).await.unwrap();

        let defs = store.read(dir.path()).await.unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function_id, "api");
    }

    #[tokio::test]
    async fn test_current_keeps_latest_declaration() {
        let dir = tempdir().unwrap();
        let store = FunctionStore::new();
        store.append(&def(dir.path(), "api", "src/old.handler")).await.unwrap();
        store.append(&def(dir.path(), "cron", "src/cron.run")).await.unwrap();
        store.append(&def(dir.path(), "api", "src/new.handler")).await.unwrap();

        assert_eq!(store.read(dir.path()).await.unwrap().len(), 3);
        let current = store.current(dir.path()).await.unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(current[0].function_id, "api");
        assert_eq!(current[0].handler_ref, "src/new.handler");
    }

    #[tokio::test]
    async fn test_reset_truncates() {
        let dir = tempdir().unwrap();
        let store = FunctionStore::new();
        store.append(&def(dir.path(), "api", "src/api.handler")).await.unwrap();
        store.reset(dir.path()).await.unwrap();
        assert!(store.read(dir.path()).await.unwrap().is_empty());
    }
}
