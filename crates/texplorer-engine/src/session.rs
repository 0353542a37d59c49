//! One generation of wired subsystems and the operations it serves.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use texplorer_core::events::{LoadEvent, RunEvent, RunMode};
use texplorer_core::host::Debugger;
use texplorer_core::ids::{GenerationId, RunId, TestId};
use texplorer_core::tree::TestNode;
use texplorer_telemetry::ProjectLogger;

use crate::channels::EventChannels;
use crate::components::RunReporter;
use crate::error::ExplorerError;
use crate::factory::SubsystemGraph;

enum Wiring {
    Live(SubsystemGraph),
    /// The factory failed; every operation reports this error.
    Failed(String),
}

/// Serves load/run/debug for one generation until superseded.
///
/// Once [`supersede`](Self::supersede) is called, in-flight operations stop
/// driving their subsystems and resolve with
/// [`ExplorerError::SessionSuperseded`], and new calls are rejected.
pub struct ExplorerSession {
    generation: GenerationId,
    wiring: Wiring,
    debugger: Arc<dyn Debugger>,
    channels: Arc<EventChannels>,
    superseded: CancellationToken,
    load_lock: Mutex<()>,
    logger: ProjectLogger,
}

impl ExplorerSession {
    pub fn new(
        generation: GenerationId,
        graph: SubsystemGraph,
        debugger: Arc<dyn Debugger>,
        channels: Arc<EventChannels>,
        logger: ProjectLogger,
    ) -> Self {
        Self::with_wiring(generation, Wiring::Live(graph), debugger, channels, logger)
    }

    /// A session whose construction failed.
    pub fn failed(
        generation: GenerationId,
        error: impl Into<String>,
        debugger: Arc<dyn Debugger>,
        channels: Arc<EventChannels>,
        logger: ProjectLogger,
    ) -> Self {
        Self::with_wiring(generation, Wiring::Failed(error.into()), debugger, channels, logger)
    }

    fn with_wiring(
        generation: GenerationId,
        wiring: Wiring,
        debugger: Arc<dyn Debugger>,
        channels: Arc<EventChannels>,
        logger: ProjectLogger,
    ) -> Self {
        Self {
            generation,
            wiring,
            debugger,
            channels,
            superseded: CancellationToken::new(),
            load_lock: Mutex::new(()),
            logger,
        }
    }

    pub fn generation(&self) -> &GenerationId {
        &self.generation
    }

    pub fn subsystems(&self) -> Option<&SubsystemGraph> {
        match &self.wiring {
            Wiring::Live(graph) => Some(graph),
            Wiring::Failed(_) => None,
        }
    }

    pub fn build_error(&self) -> Option<&str> {
        match &self.wiring {
            Wiring::Live(_) => None,
            Wiring::Failed(e) => Some(e),
        }
    }

    pub fn debugger(&self) -> &Arc<dyn Debugger> {
        &self.debugger
    }

    /// Last loaded tree, if any.
    pub fn suite(&self) -> Option<TestNode> {
        self.subsystems()?.store.root()
    }

    pub fn supersede(&self) {
        self.superseded.cancel();
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.is_cancelled()
    }

    fn ensure_current(&self) -> Result<(), ExplorerError> {
        if self.is_superseded() {
            return Err(ExplorerError::SessionSuperseded);
        }
        Ok(())
    }

    fn graph(&self) -> Result<&SubsystemGraph, ExplorerError> {
        match &self.wiring {
            Wiring::Live(graph) => Ok(graph),
            Wiring::Failed(e) => Err(ExplorerError::Factory(e.clone())),
        }
    }

    /// Drive `fut` unless the session is superseded first.
    async fn guarded<T, F>(&self, fut: F) -> Result<T, ExplorerError>
    where
        F: Future<Output = Result<T, ExplorerError>>,
    {
        tokio::select! {
            biased;
            _ = self.superseded.cancelled() => Err(ExplorerError::SessionSuperseded),
            result = fut => result,
        }
    }

    /// Discover tests. Concurrent loads on one session run one at a time.
    pub async fn load(&self) -> Result<(), ExplorerError> {
        self.ensure_current()?;
        let _serial = self.guarded(async { Ok(self.load_lock.lock().await) }).await?;

        self.channels.load.emit(LoadEvent::Started {
            generation: self.generation.clone(),
        });

        let result = match self.graph() {
            Ok(graph) => {
                self.guarded(async {
                    graph.manager.load_tests().await.map_err(ExplorerError::from)
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(suite) => {
                self.logger
                    .info(format_args!("loaded {} test(s)", suite.leaves().len()));
                self.channels.load.emit(LoadEvent::Finished {
                    generation: self.generation.clone(),
                    suite: Some(suite),
                    error: None,
                });
                Ok(())
            }
            // A newer generation owns the load channel now
            Err(ExplorerError::SessionSuperseded) => Err(ExplorerError::SessionSuperseded),
            Err(e) => {
                self.logger.error(format_args!("load failed: {e}"));
                self.channels.load.emit(LoadEvent::Finished {
                    generation: self.generation.clone(),
                    suite: None,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    pub async fn run(&self, tests: &[TestId]) -> Result<RunId, ExplorerError> {
        self.execute(tests, RunMode::Run).await
    }

    pub async fn debug(&self, tests: &[TestId]) -> Result<RunId, ExplorerError> {
        self.execute(tests, RunMode::Debug).await
    }

    async fn execute(&self, tests: &[TestId], mode: RunMode) -> Result<RunId, ExplorerError> {
        self.ensure_current()?;
        if let Some(bad) = tests.iter().find(|t| !t.is_well_formed()) {
            return Err(ExplorerError::MalformedTestId(bad.as_str().to_string()));
        }
        let run_id = RunId::new();
        self.channels.run.emit(RunEvent::Started {
            generation: self.generation.clone(),
            run_id: run_id.clone(),
            tests: tests.to_vec(),
            mode,
        });

        let reporter = RunReporter::new(run_id.clone(), Arc::clone(&self.channels));
        let result = match self.graph() {
            Err(e) => Err(e),
            Ok(_) if tests.is_empty() => Ok(()),
            Ok(graph) => {
                self.guarded(async {
                    graph
                        .manager
                        .run_tests(tests, mode, &reporter)
                        .await
                        .map_err(ExplorerError::from)
                })
                .await
            }
        };

        // Every started run gets a finish, superseded or not
        let error = result.as_ref().err().map(ToString::to_string);
        if let Some(e) = &error {
            self.logger.warn(format_args!("run {run_id} ended with error: {e}"));
        }
        self.channels.run.emit(RunEvent::Finished {
            generation: self.generation.clone(),
            run_id: run_id.clone(),
            error,
        });
        result.map(|()| run_id)
    }
}

impl std::fmt::Debug for ExplorerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplorerSession")
            .field("generation", &self.generation)
            .field("failed", &self.build_error())
            .field("superseded", &self.is_superseded())
            .finish()
    }
}
