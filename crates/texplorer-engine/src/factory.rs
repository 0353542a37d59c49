//! Builds one generation of subsystem components.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use texplorer_core::dispose::Disposable;
use texplorer_core::host::{Debugger, FileHandler, PortClient};
use texplorer_core::ids::GenerationId;
use texplorer_settings::ExplorerSettings;
use texplorer_telemetry::ProjectLogger;

use crate::channels::EventChannels;
use crate::components::{
    CommandProcessHandler, FileWatcher, ManifestLocator, MemoryTestStore, NotifyFileWatcher,
    ProcessHandler, RunnerConfig, RunnerTestManager, TestLocator, TestManager, TestStore,
    WatchConfig,
};
use crate::error::ExplorerError;
use crate::registry::DisposalRegistry;

/// Project-scoped collaborators that outlive every generation.
#[derive(Clone)]
pub struct SharedCollaborators {
    pub logger: ProjectLogger,
    pub files: Arc<dyn FileHandler>,
    pub ports: Arc<dyn PortClient>,
    pub debugger: Arc<dyn Debugger>,
    pub channels: Arc<EventChannels>,
}

/// Inputs for building one generation.
pub struct FactoryContext<'a> {
    pub generation: &'a GenerationId,
    pub project: &'a str,
    pub settings: &'a ExplorerSettings,
    pub shared: &'a SharedCollaborators,
}

impl FactoryContext<'_> {
    /// Working directory: `settings.cwd` resolved against the workspace.
    pub fn cwd(&self) -> PathBuf {
        match &self.settings.cwd {
            Some(cwd) => self.shared.files.resolve(std::path::Path::new(cwd)),
            None => self.shared.files.cwd().to_path_buf(),
        }
    }
}

/// The components of one generation.
#[derive(Clone)]
pub struct SubsystemGraph {
    pub process: Arc<dyn ProcessHandler>,
    pub locator: Arc<dyn TestLocator>,
    pub store: Arc<dyn TestStore>,
    pub manager: Arc<dyn TestManager>,
    pub watcher: Arc<dyn FileWatcher>,
}

impl SubsystemGraph {
    /// Construction order; the session registry releases them in reverse.
    pub fn disposables(&self) -> Vec<Arc<dyn Disposable>> {
        vec![
            self.process.clone() as Arc<dyn Disposable>,
            self.locator.clone() as Arc<dyn Disposable>,
            self.store.clone() as Arc<dyn Disposable>,
            self.manager.clone() as Arc<dyn Disposable>,
            self.watcher.clone() as Arc<dyn Disposable>,
        ]
    }
}

#[async_trait]
pub trait ComponentFactory: Send + Sync {
    async fn build(&self, ctx: &FactoryContext<'_>) -> Result<SubsystemGraph, ExplorerError>;
}

/// Wires the stock components: a command runner fed by a JSON manifest.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultComponentFactory;

#[async_trait]
impl ComponentFactory for DefaultComponentFactory {
    async fn build(&self, ctx: &FactoryContext<'_>) -> Result<SubsystemGraph, ExplorerError> {
        let settings = ctx.settings;
        let shared = ctx.shared;
        let logger = &shared.logger;
        let cwd = ctx.cwd();
        let manifest = cwd.join(&settings.manifest);

        let process: Arc<dyn ProcessHandler> =
            Arc::new(CommandProcessHandler::new(logger.component("process")));
        let locator: Arc<dyn TestLocator> = Arc::new(ManifestLocator::new(
            Arc::clone(&shared.files),
            manifest,
            ctx.project,
            logger.component("locator"),
        ));
        let store: Arc<dyn TestStore> = Arc::new(MemoryTestStore::new(cwd.clone()));
        let manager: Arc<dyn TestManager> = Arc::new(RunnerTestManager::new(
            RunnerConfig {
                cwd: cwd.clone(),
                runner: settings.runner.clone(),
                debug: settings.debug.clone(),
            },
            Arc::clone(&process),
            Arc::clone(&locator),
            Arc::clone(&store),
            Arc::clone(&shared.ports),
            Arc::clone(&shared.debugger),
            logger.component("manager"),
        ));

        let watcher: Arc<dyn FileWatcher> = if settings.watch.enabled {
            let started = NotifyFileWatcher::start(
                WatchConfig {
                    root: cwd,
                    include: settings.watch.include.clone(),
                    exclude: settings.watch.exclude.clone(),
                    debounce: Duration::from_millis(settings.watch.debounce_ms),
                },
                locator.sources(),
                Arc::clone(&store),
                Arc::clone(&shared.channels),
                logger.component("watcher"),
            );
            match started {
                Ok(watcher) => Arc::new(watcher),
                Err(e) => {
                    // Release what was already built before reporting
                    let partial = DisposalRegistry::new("partial-generation");
                    for d in [
                        process.clone() as Arc<dyn Disposable>,
                        locator.clone() as Arc<dyn Disposable>,
                        store.clone() as Arc<dyn Disposable>,
                        manager.clone() as Arc<dyn Disposable>,
                    ] {
                        partial.register(d);
                    }
                    partial.dispose_all().await;
                    return Err(ExplorerError::Factory(e.to_string()));
                }
            }
        } else {
            Arc::new(NotifyFileWatcher::disabled(logger.component("watcher")))
        };

        Ok(SubsystemGraph {
            process,
            locator,
            store,
            manager,
            watcher,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFileHandler;
    use crate::mock::{MockDebugger, MockPortClient};
    use texplorer_core::level::LogLevel;

    fn shared(dir: &std::path::Path) -> SharedCollaborators {
        SharedCollaborators {
            logger: ProjectLogger::new("demo", LogLevel::Off),
            files: Arc::new(LocalFileHandler::new(dir)),
            ports: Arc::new(MockPortClient::new(9000)),
            debugger: Arc::new(MockDebugger::new("texplorer.demo")),
            channels: Arc::new(EventChannels::default()),
        }
    }

    #[test]
    fn cwd_resolves_against_workspace() {
        let shared = shared(std::path::Path::new("/work"));
        let generation = GenerationId::new();
        let mut settings = ExplorerSettings::default();
        let ctx = FactoryContext {
            generation: &generation,
            project: "demo",
            settings: &settings,
            shared: &shared,
        };
        assert_eq!(ctx.cwd(), PathBuf::from("/work"));

        settings.cwd = Some("crates/app".into());
        let ctx = FactoryContext {
            generation: &generation,
            project: "demo",
            settings: &settings,
            shared: &shared,
        };
        assert_eq!(ctx.cwd(), PathBuf::from("/work/crates/app"));
    }

    #[tokio::test]
    async fn default_factory_builds_a_loadable_graph() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("tests.json"),
            r#"[{"id":"a","label":"a","kind":"test","file":"src/a.rs"}]"#,
        )
        .unwrap();
        let shared = shared(dir.path());
        let generation = GenerationId::new();
        let mut settings = ExplorerSettings::default();
        settings.watch.enabled = false;

        let graph = DefaultComponentFactory
            .build(&FactoryContext {
                generation: &generation,
                project: "demo",
                settings: &settings,
                shared: &shared,
            })
            .await
            .unwrap();

        let root = graph.manager.load_tests().await.unwrap();
        assert_eq!(root.leaves().len(), 1);
        assert!(graph.store.root().is_some());
        assert!(!graph.watcher.is_watching());
        assert_eq!(
            graph.locator.sources(),
            vec![dir.path().join("tests.json")]
        );

        let names: Vec<String> = graph
            .disposables()
            .iter()
            .map(|d| d.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["process-handler", "locator", "test-store", "test-manager", "file-watcher"]
        );
    }

    #[tokio::test]
    async fn bad_watch_pattern_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let shared = shared(dir.path());
        let generation = GenerationId::new();
        let mut settings = ExplorerSettings::default();
        settings.watch.include = vec!["[".into()];

        let result = DefaultComponentFactory
            .build(&FactoryContext {
                generation: &generation,
                project: "demo",
                settings: &settings,
                shared: &shared,
            })
            .await;
        assert!(matches!(result, Err(ExplorerError::Factory(_))));
    }
}
