//! Dependency-aware build scheduling.
//!
//! Every known function carries its resolved [`BuildInstruction`] and the compiled form of its
//! `watchInclude` globs. A `file.changed` event rebuilds only the functions whose globs match
//! the path. Builds of the same function never overlap: a request that arrives while one is
//! running is folded into a single follow-up build.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use faas_common::topics::{BuildFailed, BuildFailure, BuildSucceeded, BuildSuccess, FileChanged};
use faas_common::{EventBus, FunctionDefinition, Semaphore, Subscription};
use futures::future::join_all;
use glob::{MatchOptions, Pattern};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument, warn};

use crate::builder::{prune_artifacts, Builder};
use crate::runtime::{absolute_pattern, BuildInstruction, RuntimeRegistry};
use crate::store::FunctionStore;
use crate::watcher::PathWatcher;
use crate::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

struct FunctionBuild {
    definition: FunctionDefinition,
    /// `None` while the definition does not resolve; retried on every build request.
    instruction: Option<BuildInstruction>,
    watch_include: Vec<String>,
    patterns: Vec<Pattern>,
    artifact: Option<PathBuf>,
    in_flight: bool,
    pending: bool,
}

impl FunctionBuild {
    fn new(definition: FunctionDefinition) -> Self {
        Self {
            definition,
            instruction: None,
            watch_include: Vec::new(),
            patterns: Vec::new(),
            artifact: None,
            in_flight: false,
            pending: false,
        }
    }

    fn set_watch(&mut self, globs: Vec<String>) {
        let mut globs = globs;
        globs.sort();
        globs.dedup();
        self.patterns = globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(function_id = %self.definition.function_id, glob = %glob, error = %e, "Ignoring invalid watch pattern");
                    None
                }
            })
            .collect();
        self.watch_include = globs;
    }

    fn matches(&self, path: &Path) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_path_with(path, MATCH_OPTIONS))
    }
}

#[derive(Default)]
struct State {
    functions: HashMap<String, FunctionBuild>,
    /// Last set handed to the watcher.
    registered: Vec<String>,
}

struct Inner {
    bus: EventBus,
    builder: Arc<dyn Builder>,
    watcher: Arc<dyn PathWatcher>,
    registry: RuntimeRegistry,
    semaphore: Semaphore,
    store: FunctionStore,
    root: PathBuf,
    handle: Handle,
    state: Mutex<State>,
    changes: Mutex<Option<Subscription>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    inner: Arc<Inner>,
}

impl BuildOrchestrator {
    /// Must be called from within a tokio runtime; rebuilds triggered by file events run on it.
    pub fn new(
        bus: EventBus,
        builder: Arc<dyn Builder>,
        watcher: Arc<dyn PathWatcher>,
        semaphore: Semaphore,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::SchedulingFailed(format!("no tokio runtime: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                bus,
                builder,
                watcher,
                registry: RuntimeRegistry::new(),
                semaphore,
                store: FunctionStore::new(),
                root: root.into(),
                handle,
                state: Mutex::new(State::default()),
                changes: Mutex::new(None),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Resolves and builds every definition, then registers the watch set.
    #[instrument(skip(self, definitions), fields(count = definitions.len()))]
    pub async fn start(&self, definitions: Vec<FunctionDefinition>) -> Result<()> {
        self.listen();
        let ids = self.register(definitions, false);
        info!(functions = ids.len(), concurrency = self.inner.semaphore.max(), "Running initial builds");
        self.build_all(ids).await;
        self.sync_watcher();
        Ok(())
    }

    /// Replaces the function set after the resource graph was re-evaluated: the store is reset
    /// and repopulated, then every function is rebuilt.
    #[instrument(skip(self, definitions), fields(count = definitions.len()))]
    pub async fn reload(&self, definitions: Vec<FunctionDefinition>) -> Result<()> {
        self.inner.store.reset(&self.inner.root).await?;
        for definition in &definitions {
            self.inner.store.append(definition).await?;
        }
        self.listen();
        let ids = self.register(definitions, true);
        self.build_all(ids).await;
        self.sync_watcher();
        Ok(())
    }

    /// Requests a rebuild; folds into the running build when one is in flight.
    pub fn rebuild(&self, function_id: &str) -> Result<()> {
        if !self.inner.state().functions.contains_key(function_id) {
            return Err(Error::FunctionNotFound(function_id.to_string()));
        }
        self.schedule(function_id.to_string());
        Ok(())
    }

    /// Functions whose watch set contains `path`, sorted.
    pub fn affected(&self, path: &Path) -> Vec<String> {
        let state = self.inner.state();
        let mut ids: Vec<String> = state
            .functions
            .iter()
            .filter(|(_, build)| build.matches(path))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn on_file_changed(&self, path: &Path) {
        let affected = self.affected(path);
        if affected.is_empty() {
            debug!(file = %path.display(), "Change matches no function");
            return;
        }
        info!(file = %path.display(), functions = ?affected, "Source changed, rebuilding");
        for function_id in affected {
            self.schedule(function_id);
        }
    }

    /// Union of every function's watch set.
    pub fn watch_include(&self) -> Vec<String> {
        let state = self.inner.state();
        let set: BTreeSet<&String> = state
            .functions
            .values()
            .flat_map(|build| build.watch_include.iter())
            .collect();
        set.into_iter().cloned().collect()
    }

    pub fn function_watch_include(&self, function_id: &str) -> Option<Vec<String>> {
        self.inner
            .state()
            .functions
            .get(function_id)
            .map(|build| build.watch_include.clone())
    }

    /// Artifact of the last successful build.
    pub fn artifact(&self, function_id: &str) -> Option<PathBuf> {
        self.inner
            .state()
            .functions
            .get(function_id)
            .and_then(|build| build.artifact.clone())
    }

    pub fn instruction(&self, function_id: &str) -> Option<BuildInstruction> {
        self.inner
            .state()
            .functions
            .get(function_id)
            .and_then(|build| build.instruction.clone())
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        let state = self.inner.state();
        let mut defs: Vec<_> = state
            .functions
            .values()
            .map(|build| build.definition.clone())
            .collect();
        defs.sort_by(|a, b| a.function_id.cmp(&b.function_id));
        defs
    }

    pub fn builds_in_flight(&self) -> usize {
        self.inner
            .state()
            .functions
            .values()
            .filter(|build| build.in_flight)
            .count()
    }

    fn listen(&self) {
        let mut changes = self
            .inner
            .changes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if changes.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *changes = Some(self.inner.bus.subscribe::<FileChanged, _>(move |change| {
            if let Some(inner) = weak.upgrade() {
                BuildOrchestrator { inner }.on_file_changed(&change.file);
            }
        }));
    }

    /// Resolves each definition and records it. With `replace`, functions absent from
    /// `definitions` are dropped.
    fn register(&self, definitions: Vec<FunctionDefinition>, replace: bool) -> Vec<String> {
        let mut state = self.inner.state();
        if replace {
            let keep: BTreeSet<&str> = definitions.iter().map(|d| d.function_id.as_str()).collect();
            state.functions.retain(|id, _| keep.contains(id.as_str()));
        }

        let mut ids = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let function_id = definition.function_id.clone();
            let mut build = match state.functions.remove(&function_id) {
                Some(mut existing) => {
                    existing.definition = definition;
                    existing.instruction = None;
                    existing
                }
                None => FunctionBuild::new(definition),
            };
            if let Some(e) = self.resolve_into(&mut build) {
                debug!(function_id = %function_id, error = %e, "Definition does not resolve yet");
            }
            state.functions.insert(function_id.clone(), build);
            ids.push(function_id);
        }
        ids
    }

    fn resolve_into(&self, build: &mut FunctionBuild) -> Option<Error> {
        match self.inner.registry.resolve(&build.definition) {
            Ok(instruction) => {
                build.set_watch(instruction.watch_include.clone());
                build.instruction = Some(instruction);
                None
            }
            Err(e) => {
                // Watch the whole source tree so the function recovers once its handler appears.
                let src_root = build.definition.src_root();
                build.set_watch(vec![absolute_pattern(&src_root, "**/*")]);
                build.instruction = None;
                Some(e)
            }
        }
    }

    async fn build_all(&self, ids: Vec<String>) {
        let runs = ids.into_iter().filter_map(|id| {
            let claimed = self.claim(&id);
            claimed.then(|| self.drive(id))
        });
        join_all(runs).await;
    }

    fn schedule(&self, function_id: String) {
        if !self.claim(&function_id) {
            debug!(function_id = %function_id, "Build in flight, coalescing");
            return;
        }
        let this = self.clone();
        self.inner.handle.spawn(async move {
            this.drive(function_id).await;
            this.sync_watcher();
        });
    }

    /// Marks the function in flight. Returns false when a build is already running, in which
    /// case one follow-up build is queued.
    fn claim(&self, function_id: &str) -> bool {
        let mut state = self.inner.state();
        match state.functions.get_mut(function_id) {
            Some(build) if build.in_flight => {
                build.pending = true;
                false
            }
            Some(build) => {
                build.in_flight = true;
                true
            }
            None => false,
        }
    }

    async fn drive(&self, function_id: String) {
        loop {
            self.build_once(&function_id).await;

            let mut state = self.inner.state();
            let Some(build) = state.functions.get_mut(&function_id) else {
                return;
            };
            if build.pending {
                build.pending = false;
            } else {
                build.in_flight = false;
                return;
            }
        }
    }

    async fn build_once(&self, function_id: &str) {
        let permit = match self.inner.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(function_id = %function_id, error = %e, "Build slot unavailable");
                return;
            }
        };

        let instruction = {
            let mut state = self.inner.state();
            let Some(build) = state.functions.get_mut(function_id) else {
                return;
            };
            if let Some(instruction) = build.instruction.clone() {
                Ok(instruction)
            } else {
                match self.resolve_into(build) {
                    None => build
                        .instruction
                        .clone()
                        .ok_or_else(|| Error::FunctionNotFound(function_id.to_string())),
                    Some(e) => Err(e),
                }
            }
        };
        let instruction = match instruction {
            Ok(instruction) => instruction,
            Err(e) => {
                drop(permit);
                self.publish_failure(function_id, e);
                return;
            }
        };

        let result = self.inner.builder.build(&instruction).await;
        drop(permit);

        match result {
            Ok(output) => {
                let previous = {
                    let mut state = self.inner.state();
                    let Some(build) = state.functions.get_mut(function_id) else {
                        return;
                    };
                    // Once the builder reports its inputs they replace the runtime's
                    // bootstrap globs.
                    if !output.inputs.is_empty() {
                        let mut globs = instruction.user_watch.clone();
                        globs.extend(
                            output
                                .inputs
                                .iter()
                                .map(|input| Pattern::escape(&input.to_string_lossy())),
                        );
                        build.set_watch(globs);
                    }
                    build.artifact.replace(output.artifact_path.clone())
                };
                info!(
                    function_id = %function_id,
                    artifact = %output.artifact_path.display(),
                    "Build succeeded"
                );
                self.inner.bus.publish::<BuildSucceeded>(BuildSuccess {
                    function_id: function_id.to_string(),
                    artifact_path: output.artifact_path.clone(),
                    command: output.command,
                });
                if previous.is_some() {
                    if let Err(e) = prune_artifacts(&instruction.out_dir, &output.artifact_path).await {
                        debug!(function_id = %function_id, error = %e, "Failed to prune artifacts");
                    }
                }
            }
            Err(e) => self.publish_failure(function_id, e),
        }
    }

    fn publish_failure(&self, function_id: &str, error: Error) {
        let errors = error.into_build_errors();
        warn!(function_id = %function_id, errors = ?errors, "Build failed, keeping previous artifact");
        self.inner.bus.publish::<BuildFailed>(BuildFailure {
            function_id: function_id.to_string(),
            errors,
        });
    }

    /// Hands the aggregate watch set to the watcher when it changed since the last call.
    fn sync_watcher(&self) {
        let union = self.watch_include();
        {
            let mut state = self.inner.state();
            if state.registered == union {
                return;
            }
            state.registered = union.clone();
        }
        debug!(patterns = union.len(), "Registering watch set");
        if let Err(e) = self.inner.watcher.watch(&union) {
            warn!(error = %e, "Failed to register watch set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct RecordingBuilder {
        builds: Mutex<Vec<String>>,
        delay: Duration,
        fail: Mutex<BTreeSet<String>>,
        /// Inputs reported per function id, as a metafile would.
        inputs: HashMap<String, Vec<PathBuf>>,
    }

    impl RecordingBuilder {
        fn count(&self, function_id: &str) -> usize {
            self.builds
                .lock()
                .unwrap()
                .iter()
                .filter(|id| *id == function_id)
                .count()
        }
    }

    #[async_trait]
    impl Builder for RecordingBuilder {
        async fn build(&self, instruction: &BuildInstruction) -> Result<BuildOutput> {
            let n = {
                let mut builds = self.builds.lock().unwrap();
                builds.push(instruction.function_id.clone());
                builds.len()
            };
            tokio::time::sleep(self.delay).await;
            if self.fail.lock().unwrap().contains(&instruction.function_id) {
                return Err(Error::BuildFailed {
                    function_id: instruction.function_id.clone(),
                    errors: vec!["SyntaxError: unexpected token".into()],
                });
            }
            Ok(BuildOutput {
                artifact_path: instruction.out_dir.join(format!("b{n}")),
                command: instruction.run_command.clone(),
                inputs: self
                    .inputs
                    .get(&instruction.function_id)
                    .cloned()
                    .unwrap_or_default(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingWatcher {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl PathWatcher for RecordingWatcher {
        fn watch(&self, patterns: &[String]) -> Result<()> {
            self.calls.lock().unwrap().push(patterns.to_vec());
            Ok(())
        }
    }

    fn project() -> (TempDir, Vec<FunctionDefinition>) {
        let dir = tempdir().unwrap();
        let mut defs = Vec::new();
        for id in ["f1", "f2"] {
            std::fs::create_dir_all(dir.path().join(id)).unwrap();
            std::fs::write(dir.path().join(id).join("main.py"), "def handler(e, c): return 1\n").unwrap();
            let mut def = FunctionDefinition::new(id, "main.handler", "python3.11", dir.path());
            def.build_options.src_path = Some(PathBuf::from(id));
            defs.push(def);
        }
        (dir, defs)
    }

    fn orchestrator(
        bus: &EventBus,
        builder: Arc<RecordingBuilder>,
        watcher: Arc<RecordingWatcher>,
        root: &Path,
    ) -> BuildOrchestrator {
        BuildOrchestrator::new(bus.clone(), builder, watcher, Semaphore::new(2), root).unwrap()
    }

    async fn settle(orchestrator: &BuildOrchestrator) {
        for _ in 0..200 {
            if orchestrator.builds_in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("builds never settled");
    }

    #[tokio::test]
    async fn test_change_rebuilds_only_affected_function() {
        let (dir, defs) = project();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder::default());
        let watcher = Arc::new(RecordingWatcher::default());
        let orchestrator = orchestrator(&bus, builder.clone(), watcher.clone(), dir.path());

        orchestrator.start(defs).await.unwrap();
        assert_eq!(builder.count("f1"), 1);
        assert_eq!(builder.count("f2"), 1);

        let changed = dir.path().join("f1/main.py");
        assert_eq!(orchestrator.affected(&changed), vec!["f1".to_string()]);
        bus.publish::<FileChanged>(faas_common::topics::FileChange { file: changed });
        tokio::time::sleep(Duration::from_millis(20)).await;
        settle(&orchestrator).await;

        assert_eq!(builder.count("f1"), 2);
        assert_eq!(builder.count("f2"), 1);
    }

    #[tokio::test]
    async fn test_unrelated_change_builds_nothing() {
        let (dir, defs) = project();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder::default());
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());
        orchestrator.start(defs).await.unwrap();

        assert!(orchestrator.affected(&dir.path().join("README.md")).is_empty());
        assert!(orchestrator.affected(&dir.path().join("f1/notes.txt")).is_empty());
        assert_eq!(
            orchestrator.affected(&dir.path().join("f2/pkg/deep/util.py")),
            vec!["f2".to_string()]
        );
    }

    #[tokio::test]
    async fn test_requests_during_build_coalesce() {
        let (dir, defs) = project();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder {
            delay: Duration::from_millis(40),
            ..Default::default()
        });
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());
        orchestrator.start(defs).await.unwrap();

        for _ in 0..4 {
            orchestrator.rebuild("f1").unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(orchestrator.builds_in_flight(), 1);
        settle(&orchestrator).await;

        // initial + running + one coalesced follow-up
        assert_eq!(builder.count("f1"), 3);
        assert!(orchestrator.rebuild("nope").is_err());
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_artifact() {
        let (dir, defs) = project();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder::default());
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());

        let succeeded = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let _ok = {
            let succeeded = succeeded.clone();
            bus.subscribe::<BuildSucceeded, _>(move |_| {
                succeeded.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _failed = {
            let failures = failures.clone();
            bus.subscribe::<BuildFailed, _>(move |f| failures.lock().unwrap().push(f.clone()))
        };

        orchestrator.start(defs).await.unwrap();
        let first = orchestrator.artifact("f1").unwrap();
        assert_eq!(succeeded.load(Ordering::SeqCst), 2);

        builder.fail.lock().unwrap().insert("f1".into());
        orchestrator.rebuild("f1").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        settle(&orchestrator).await;

        assert_eq!(orchestrator.artifact("f1").unwrap(), first);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].function_id, "f1");
        assert_eq!(failures[0].errors, vec!["SyntaxError: unexpected token".to_string()]);
    }

    #[tokio::test]
    async fn test_unresolvable_definition_reports_failure() {
        let dir = tempdir().unwrap();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder::default());
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());

        let failures = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let failures = failures.clone();
            bus.subscribe::<BuildFailed, _>(move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            })
        };

        let defs = vec![FunctionDefinition::new("legacy", "Handler::Run", "dotnet6", dir.path())];
        orchestrator.start(defs).await.unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(builder.count("legacy"), 0);
        assert!(orchestrator.artifact("legacy").is_none());
    }

    #[tokio::test]
    async fn test_builder_inputs_replace_bootstrap_globs() {
        let (dir, mut defs) = project();
        let shared = dir.path().join("shared/config.json");
        defs[1].build_options.watch = vec!["fixtures/*.json".into()];
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder {
            inputs: HashMap::from([
                ("f1".to_string(), vec![shared.clone()]),
                ("f2".to_string(), vec![shared.clone()]),
            ]),
            ..Default::default()
        });
        let watcher = Arc::new(RecordingWatcher::default());
        let orchestrator = orchestrator(&bus, builder, watcher.clone(), dir.path());
        orchestrator.start(defs).await.unwrap();

        assert_eq!(
            orchestrator.affected(&shared),
            vec!["f1".to_string(), "f2".to_string()]
        );
        // the src tree globs are gone, user globs stay
        assert!(orchestrator.affected(&dir.path().join("f1/notes.py")).is_empty());
        assert_eq!(
            orchestrator.affected(&dir.path().join("f2/fixtures/event.json")),
            vec!["f2".to_string()]
        );

        let calls = watcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&shared.to_string_lossy().into_owned()));
        assert!(!calls[0].iter().any(|glob| glob.ends_with("**/*.py")));
    }

    #[tokio::test]
    async fn test_node_functions_sharing_a_root_watch_their_own_inputs() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.ts"), "export const handler = async () => 'a';\n").unwrap();
        std::fs::write(src.join("b.ts"), "export const handler = async () => 'b';\n").unwrap();
        let defs = vec![
            FunctionDefinition::new("f1", "src/a.handler", "nodejs18.x", dir.path()),
            FunctionDefinition::new("f2", "src/b.handler", "nodejs18.x", dir.path()),
        ];

        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder {
            inputs: HashMap::from([
                ("f1".to_string(), vec![src.join("a.ts")]),
                ("f2".to_string(), vec![src.join("b.ts")]),
            ]),
            ..Default::default()
        });
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());

        orchestrator.register(defs.clone(), false);
        // before the first build the runtime globs cover every source file
        assert_eq!(
            orchestrator.affected(&src.join("a.ts")),
            vec!["f1".to_string(), "f2".to_string()]
        );

        orchestrator.start(defs).await.unwrap();
        assert_eq!(orchestrator.affected(&src.join("a.ts")), vec!["f1".to_string()]);
        assert_eq!(orchestrator.affected(&src.join("b.ts")), vec!["f2".to_string()]);
        assert!(orchestrator.affected(&src.join("unused.ts")).is_empty());

        let f2 = orchestrator.function_watch_include("f2").unwrap();
        assert_eq!(f2, vec![src.join("b.ts").to_string_lossy().into_owned()]);

        bus.publish::<FileChanged>(faas_common::topics::FileChange { file: src.join("a.ts") });
        tokio::time::sleep(Duration::from_millis(20)).await;
        settle(&orchestrator).await;
        assert_eq!(builder.count("f1"), 2);
        assert_eq!(builder.count("f2"), 1);
    }

    #[tokio::test]
    async fn test_reload_resets_store_and_rebuilds() {
        let (dir, defs) = project();
        let bus = EventBus::new();
        let builder = Arc::new(RecordingBuilder::default());
        let orchestrator = orchestrator(&bus, builder.clone(), Arc::default(), dir.path());
        orchestrator.start(defs.clone()).await.unwrap();

        orchestrator.reload(vec![defs[1].clone()]).await.unwrap();
        assert_eq!(builder.count("f2"), 2);
        assert_eq!(builder.count("f1"), 1);
        assert_eq!(orchestrator.definitions().len(), 1);

        let stored = FunctionStore::new().current(dir.path()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].function_id, "f2");
    }
}
