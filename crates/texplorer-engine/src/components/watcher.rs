use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_core::events::RetireEvent;
use texplorer_telemetry::ProjectLogger;

use super::{FileWatcher, TestStore};
use crate::channels::EventChannels;

#[derive(Clone, Debug)]
pub struct WatchConfig {
    pub root: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub debounce: Duration,
}

/// Include/exclude globs, matched against paths relative to the watch root.
#[derive(Debug)]
pub struct WatchFilter {
    root: PathBuf,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ComponentError> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| ComponentError::InvalidConfig(format!("bad watch pattern {p:?}: {e}")))
        })
        .collect()
}

impl WatchFilter {
    pub fn new(config: &WatchConfig) -> Result<Self, ComponentError> {
        Ok(Self {
            root: config.root.clone(),
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        if self.exclude.iter().any(|p| p.matches_path(rel)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches_path(rel))
    }
}

/// Retire event for a batch of changed paths, if any known test is affected.
/// A change to one of `sources` invalidates everything.
fn retirement_for(
    paths: &[PathBuf],
    filter: &WatchFilter,
    store: &dyn TestStore,
    sources: &[PathBuf],
) -> Option<RetireEvent> {
    if paths.iter().any(|p| sources.contains(p)) {
        return Some(RetireEvent::all());
    }

    let mut seen = HashSet::new();
    let mut tests = Vec::new();
    for path in paths.iter().filter(|p| filter.matches(p)) {
        for id in store.tests_in_file(path) {
            if seen.insert(id.clone()) {
                tests.push(id);
            }
        }
    }
    (!tests.is_empty()).then(|| RetireEvent::tests(tests))
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Consume changed paths until shutdown. Changes arriving within `debounce`
/// of the first one are coalesced into one event.
fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<PathBuf>,
    debounce: Duration,
    filter: WatchFilter,
    sources: Vec<PathBuf>,
    store: Arc<dyn TestStore>,
    channels: Arc<EventChannels>,
    shutdown: CancellationToken,
    logger: ProjectLogger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                path = rx.recv() => match path {
                    Some(path) => path,
                    None => break,
                },
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
            let mut batch = vec![first];
            while let Ok(path) = rx.try_recv() {
                batch.push(path);
            }

            if let Some(event) = retirement_for(&batch, &filter, store.as_ref(), &sources) {
                match &event.tests {
                    None => logger.debug("test sources changed, retiring all results"),
                    Some(tests) => logger.debug(format_args!("retiring {} result(s)", tests.len())),
                }
                channels.retire.emit(event);
            }
        }
    })
}

/// [`FileWatcher`] backed by the platform's native notification API.
pub struct NotifyFileWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    logger: ProjectLogger,
}

impl NotifyFileWatcher {
    pub fn start(
        config: WatchConfig,
        sources: Vec<PathBuf>,
        store: Arc<dyn TestStore>,
        channels: Arc<EventChannels>,
        logger: ProjectLogger,
    ) -> Result<Self, ComponentError> {
        let filter = WatchFilter::new(&config)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if is_content_change(&event.kind) {
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| ComponentError::Io(format!("file watcher: {e}")))?;
        watcher
            .watch(&config.root, RecursiveMode::Recursive)
            .map_err(|e| ComponentError::Io(format!("watch {}: {e}", config.root.display())))?;

        let shutdown = CancellationToken::new();
        let task = spawn_dispatcher(
            rx,
            config.debounce,
            filter,
            sources,
            store,
            channels,
            shutdown.clone(),
            logger.clone(),
        );
        logger.debug(format_args!("watching {}", config.root.display()));

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
            shutdown,
            logger,
        })
    }

    /// A watcher that never reports anything.
    pub fn disabled(logger: ProjectLogger) -> Self {
        Self {
            watcher: Mutex::new(None),
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            logger,
        }
    }
}

impl FileWatcher for NotifyFileWatcher {
    fn is_watching(&self) -> bool {
        self.watcher.lock().is_some()
    }
}

#[async_trait]
impl Disposable for NotifyFileWatcher {
    fn name(&self) -> &str {
        "file-watcher"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.shutdown.cancel();
        let watcher = self.watcher.lock().take();
        drop(watcher);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                self.logger.warn(format_args!("watch dispatcher ended abnormally: {e}"));
            }
        }
        Ok(())
    }
}
