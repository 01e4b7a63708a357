//! Debounced filesystem change notifier.
//!
//! Raw notify events are funnelled into one debounce task. A path is published as
//! `file.changed` once its size and mtime have held still for the stability threshold, so an
//! editor's write-rename-chmod burst, or two saves in quick succession, produce one event.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use faas_common::topics::{FileChange, FileChanged};
use faas_common::EventBus;
use ignore::gitignore::Gitignore;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::{Error, Result};

/// Build output and metadata directories; changes under these never trigger a rebuild.
pub const IGNORED_DIRS: &[&str] = &[
    "artifacts",
    ".faas-dev",
    ".git",
    "node_modules",
    "target",
    "__pycache__",
];

/// Anything able to take over a set of watch globs.
pub trait PathWatcher: Send + Sync {
    /// Replaces the previous watch set.
    fn watch(&self, patterns: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    pub stability: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stability: Duration::from_millis(20),
        }
    }
}

struct Active {
    _watcher: RecommendedWatcher,
    dirs: Vec<PathBuf>,
}

/// Decides which raw events reach the debounce task. Shared with notify's callback thread.
struct Filter {
    root: PathBuf,
    gitignore: Option<Gitignore>,
    tx: mpsc::UnboundedSender<PathBuf>,
}

impl Filter {
    fn is_ignored(&self, path: &Path) -> bool {
        if is_ignored_dir(&self.root, path) {
            return true;
        }
        match &self.gitignore {
            Some(gitignore) if path.starts_with(&self.root) => gitignore
                .matched_path_or_any_parents(path, path.is_dir())
                .is_ignore(),
            _ => false,
        }
    }

    fn forward(&self, event: Event) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        for path in event.paths {
            if self.is_ignored(&path) {
                trace!(path = %path.display(), "Ignored change");
                continue;
            }
            if self.tx.send(path).is_err() {
                return;
            }
        }
    }
}

pub struct FileWatcher {
    config: WatchConfig,
    filter: Arc<Filter>,
    active: Mutex<Option<Active>>,
    debounce: JoinHandle<()>,
}

impl FileWatcher {
    pub fn new(bus: EventBus, root: impl Into<PathBuf>, config: WatchConfig) -> Result<Self> {
        let root = root.into();
        let handle = Handle::try_current()
            .map_err(|e| Error::SchedulingFailed(format!("no tokio runtime: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let debounce = handle.spawn(debounce(bus, config, rx));

        let gitignore_path = root.join(".gitignore");
        let gitignore = gitignore_path.is_file().then(|| {
            let (matcher, err) = Gitignore::new(&gitignore_path);
            if let Some(e) = err {
                warn!(path = %gitignore_path.display(), error = %e, "Partially invalid .gitignore");
            }
            matcher
        });

        Ok(Self {
            config,
            filter: Arc::new(Filter { root, gitignore, tx }),
            active: Mutex::new(None),
            debounce,
        })
    }

    pub fn config(&self) -> WatchConfig {
        self.config
    }

    /// Directories currently watched.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|active| active.dirs.clone())
            .unwrap_or_default()
    }

    pub fn is_ignored(&self, path: &Path) -> bool {
        self.filter.is_ignored(path)
    }
}

impl PathWatcher for FileWatcher {
    fn watch(&self, patterns: &[String]) -> Result<()> {
        let dirs = watch_roots(patterns);

        let filter = self.filter.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => filter.forward(event),
                Err(e) => warn!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(self.config.poll_interval),
        )?;
        for dir in &dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
        }

        // The new watcher is live before the old one is dropped.
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Active {
                _watcher: watcher,
                dirs: dirs.clone(),
            });
        drop(previous);
        info!(dirs = ?dirs, patterns = patterns.len(), "Watching");
        Ok(())
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

fn is_ignored_dir(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| match component {
        Component::Normal(name) => name
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name)),
        _ => false,
    })
}

/// Static prefix of a glob: every leading component free of glob syntax. A pattern without
/// any glob syntax names a file, so its parent directory is watched.
pub fn static_base(pattern: &str) -> PathBuf {
    let mut base = PathBuf::new();
    let mut literal = true;
    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[', '{']) {
            literal = false;
            break;
        }
        base.push(component.as_os_str());
    }
    if literal {
        base.pop();
    }
    base
}

/// Smallest set of existing directories covering every pattern.
pub fn watch_roots(patterns: &[String]) -> Vec<PathBuf> {
    let mut bases: Vec<PathBuf> = patterns
        .iter()
        .map(|pattern| {
            let mut base = static_base(pattern);
            while !base.as_os_str().is_empty() && !base.is_dir() {
                if !base.pop() {
                    break;
                }
            }
            base
        })
        .filter(|base| !base.as_os_str().is_empty())
        .collect();
    bases.sort();
    bases.dedup();

    let mut roots: Vec<PathBuf> = Vec::new();
    for base in bases {
        if !roots.iter().any(|root| base.starts_with(root)) {
            roots.push(base);
        }
    }
    roots
}

type Signature = Option<(u64, Option<SystemTime>)>;

struct Pending {
    signature: Signature,
    since: Instant,
}

async fn signature(path: &Path) -> Signature {
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|meta| (meta.len(), meta.modified().ok()))
}

/// Publishes each path once its size and mtime are unchanged for `config.stability`.
pub(crate) async fn debounce(
    bus: EventBus,
    config: WatchConfig,
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
) {
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut tick = tokio::time::interval(config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(path) => {
                    let now = Instant::now();
                    pending
                        .entry(path)
                        .and_modify(|p| p.since = now)
                        .or_insert(Pending { signature: None, since: now });
                }
                None => break,
            },
            _ = tick.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let now = Instant::now();
                let mut ready = Vec::new();
                for (path, p) in pending.iter_mut() {
                    let current = signature(path).await;
                    if current != p.signature {
                        p.signature = current;
                        p.since = now;
                    } else if now.duration_since(p.since) >= config.stability {
                        ready.push(path.clone());
                    }
                }
                for path in ready {
                    pending.remove(&path);
                    debug!(file = %path.display(), "file changed");
                    bus.publish::<FileChanged>(FileChange { file: path });
                }
            }
        }
    }
}
