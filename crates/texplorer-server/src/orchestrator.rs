//! Per-project orchestrator: owns the identity-stable collaborators and the
//! current [`ExplorerSession`], and replaces the session wholesale on reset.
//!
//! Two disposal scopes are kept. The process scope holds what lives as long
//! as the orchestrator (logger, commands, port client, debugger, channels);
//! the session scope holds the components of the current generation and is
//! emptied on every reset.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use texplorer_core::dispose::Disposable;
use texplorer_core::events::{LoadEvent, RetireEvent, RunEvent};
use texplorer_core::host::{ConfigStore, Debugger, FileHandler, NoticeLevel, PortManager, StatusSink};
use texplorer_core::ids::{GenerationId, RunId, TestId};
use texplorer_core::level::LogLevel;
use texplorer_engine::fs::LocalFileHandler;
use texplorer_engine::{
    ComponentFactory, DisposalRegistry, EventChannels, ExplorerError, ExplorerSession,
    FactoryContext, SharedCollaborators,
};
use texplorer_settings::{ExplorerSettings, SECTION};
use texplorer_telemetry::{ProjectLogger, SqliteLogSink};

use crate::commands::{CommandHandler, CommandRegistry};
use crate::host::NoticeDebugger;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const SHOW_LOG_LIMIT: usize = 200;
const LOG_LEVEL_KEY: &str = "texplorer.logLevel";

/// Everything the host knows about one project.
#[derive(Clone)]
pub struct ProjectContext {
    pub workspace: PathBuf,
    /// Display name, also the label of the root suite.
    pub name: String,
    /// Prefix for command ids and the logger's project field.
    pub namespace: String,
    pub config: Arc<dyn ConfigStore>,
    pub ports: Arc<dyn PortManager>,
    pub status: Arc<dyn StatusSink>,
}

/// How [`Orchestrator::configuration_changed`] reacted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigChange {
    Ignored,
    LogLevel(LogLevel),
    Reset,
}

pub struct OrchestratorBuilder {
    context: ProjectContext,
    factory: Arc<dyn ComponentFactory>,
    files: Option<Arc<dyn FileHandler>>,
    debugger: Option<Arc<dyn Debugger>>,
    log_sink: Option<Arc<SqliteLogSink>>,
    commands: Option<Arc<CommandRegistry>>,
    channel_capacity: usize,
}

impl OrchestratorBuilder {
    pub fn new(context: ProjectContext, factory: Arc<dyn ComponentFactory>) -> Self {
        Self {
            context,
            factory,
            files: None,
            debugger: None,
            log_sink: None,
            commands: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Defaults to the local filesystem rooted at the workspace.
    pub fn files(mut self, files: Arc<dyn FileHandler>) -> Self {
        self.files = Some(files);
        self
    }

    /// Defaults to a [`NoticeDebugger`] reporting through the status sink.
    pub fn debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// Persisted logs served by the `show-log` command.
    pub fn log_sink(mut self, sink: Arc<SqliteLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Share one command table across projects. Defaults to a private one.
    pub fn commands(mut self, commands: Arc<CommandRegistry>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Wire the process-scoped collaborators and the first generation.
    /// No load is started; call [`Orchestrator::load`] when ready.
    pub async fn build(self) -> Result<Arc<Orchestrator>, ExplorerError> {
        let context = self.context;
        let initial_level = ExplorerSettings::from_store(context.config.as_ref())
            .map(|s| s.log_level)
            .unwrap_or_default();
        let logger = ProjectLogger::new(context.namespace.clone(), initial_level);

        let process_scope = DisposalRegistry::new(format!("{}:process", context.namespace));
        process_scope.register(Arc::new(logger.clone()));

        let files = self
            .files
            .unwrap_or_else(|| Arc::new(LocalFileHandler::new(context.workspace.clone())));
        let debugger = self.debugger.unwrap_or_else(|| {
            Arc::new(NoticeDebugger::new(
                context.namespace.clone(),
                Arc::clone(&context.status),
            ))
        });
        let shared = SharedCollaborators {
            logger: logger.clone(),
            files,
            ports: context.ports.client(&context.namespace),
            debugger,
            channels: Arc::new(EventChannels::new(self.channel_capacity)),
        };

        let session_scope = DisposalRegistry::new(format!("{}:session", context.namespace));
        let first = build_generation(&context, self.factory.as_ref(), &shared, &session_scope).await;

        let orchestrator = Arc::new(Orchestrator {
            context,
            factory: self.factory,
            shared,
            commands: self.commands.unwrap_or_default(),
            log_sink: self.log_sink,
            session: RwLock::new(Arc::new(first)),
            session_scope,
            process_scope,
            reset_lock: Mutex::new(()),
            generations: AtomicUsize::new(1),
            disposed: AtomicBool::new(false),
        });

        let registered = orchestrator.register_commands();
        let shared = &orchestrator.shared;
        orchestrator.process_scope.register(Arc::clone(&shared.ports) as Arc<dyn Disposable>);
        orchestrator.process_scope.register(Arc::clone(&shared.debugger) as Arc<dyn Disposable>);
        orchestrator.process_scope.register(Arc::clone(&shared.channels) as Arc<dyn Disposable>);

        if let Err(e) = registered {
            orchestrator.dispose().await;
            return Err(e);
        }
        orchestrator.logger().info(format_args!(
            "project {} ready ({})",
            orchestrator.context.name,
            orchestrator.generation()
        ));
        Ok(orchestrator)
    }
}

/// Build one generation. Never fails: a bad configuration or a failing factory
/// yields a session that reports the error on every operation.
async fn build_generation(
    context: &ProjectContext,
    factory: &dyn ComponentFactory,
    shared: &SharedCollaborators,
    scope: &DisposalRegistry,
) -> ExplorerSession {
    let generation = GenerationId::new();
    let logger = shared.logger.component("session");
    let failed = |generation: GenerationId, error: String| {
        logger.error(format_args!("generation {generation} unusable: {error}"));
        context.status.notify(
            NoticeLevel::Error,
            &format!("{}: test explorer failed to start: {error}", context.name),
        );
        ExplorerSession::failed(
            generation,
            error,
            Arc::clone(&shared.debugger),
            Arc::clone(&shared.channels),
            logger.clone(),
        )
    };

    let settings = match ExplorerSettings::from_store(context.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => return failed(generation, ExplorerError::from(e).to_string()),
    };
    shared.logger.set_level(settings.log_level);

    let ctx = FactoryContext {
        generation: &generation,
        project: &context.name,
        settings: &settings,
        shared,
    };
    match factory.build(&ctx).await {
        Ok(graph) => {
            for disposable in graph.disposables() {
                scope.register(disposable);
            }
            logger.debug(format_args!("generation {generation} wired"));
            ExplorerSession::new(
                generation,
                graph,
                Arc::clone(&shared.debugger),
                Arc::clone(&shared.channels),
                logger.clone(),
            )
        }
        Err(ExplorerError::Factory(msg)) => failed(generation, msg),
        Err(e) => failed(generation, e.to_string()),
    }
}

/// Serves one project's test explorer for its whole lifetime.
pub struct Orchestrator {
    context: ProjectContext,
    factory: Arc<dyn ComponentFactory>,
    shared: SharedCollaborators,
    commands: Arc<CommandRegistry>,
    log_sink: Option<Arc<SqliteLogSink>>,
    session: RwLock<Arc<ExplorerSession>>,
    session_scope: DisposalRegistry,
    process_scope: DisposalRegistry,
    /// Serializes resets and final disposal.
    reset_lock: Mutex<()>,
    generations: AtomicUsize,
    disposed: AtomicBool,
}

impl Orchestrator {
    pub fn builder(context: ProjectContext, factory: Arc<dyn ComponentFactory>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(context, factory)
    }

    fn register_commands(self: &Arc<Self>) -> Result<(), ExplorerError> {
        let show_log = self.command(|this, _args| async move { this.show_log() }.boxed());
        let reset = self.command(|this, _args| {
            async move {
                this.cancel().await?;
                Ok(json!({ "generation": this.generation() }))
            }
            .boxed()
        });

        let namespace = &self.context.namespace;
        self.process_scope
            .register(self.commands.register(format!("{namespace}.show-log"), show_log)?);
        self.process_scope
            .register(self.commands.register(format!("{namespace}.reset"), reset)?);
        Ok(())
    }

    /// Adapt a method into a command handler holding only a weak reference.
    fn command<F>(self: &Arc<Self>, f: F) -> CommandHandler
    where
        F: Fn(Arc<Self>, Value) -> futures::future::BoxFuture<'static, Result<Value, ExplorerError>>
            + Send
            + Sync
            + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |args| match weak.upgrade() {
            Some(this) => f(this, args),
            None => async { Err::<Value, _>(ExplorerError::Disposed) }.boxed(),
        })
    }

    fn ensure_live(&self) -> Result<(), ExplorerError> {
        if self.is_disposed() {
            return Err(ExplorerError::Disposed);
        }
        Ok(())
    }

    pub fn current_session(&self) -> Arc<ExplorerSession> {
        self.session.read().clone()
    }

    /// Rediscover tests on the current session.
    pub async fn load(&self) -> Result<(), ExplorerError> {
        self.ensure_live()?;
        self.current_session().load().await
    }

    pub async fn run(&self, tests: &[TestId]) -> Result<RunId, ExplorerError> {
        self.ensure_live()?;
        self.current_session().run(tests).await
    }

    pub async fn debug(&self, tests: &[TestId]) -> Result<RunId, ExplorerError> {
        self.ensure_live()?;
        self.current_session().debug(tests).await
    }

    /// Full reset: release the current generation, build a fresh one from the
    /// current configuration and start loading it.
    pub async fn cancel(&self) -> Result<(), ExplorerError> {
        self.ensure_live()?;
        let _reset = self.reset_lock.lock().await;
        // dispose() may have won the lock race
        self.ensure_live()?;

        let logger = self.logger();
        let old = self.current_session();
        logger.info(format_args!("resetting generation {}", old.generation()));
        self.context.status.status(&self.context.name, "resetting");

        old.supersede();
        let report = self.session_scope.dispose_all().await;
        if report.failed > 0 {
            logger.warn(format_args!(
                "{} of {} component(s) failed to release",
                report.failed,
                report.total()
            ));
        }

        let session = Arc::new(
            build_generation(&self.context, self.factory.as_ref(), &self.shared, &self.session_scope)
                .await,
        );
        *self.session.write() = Arc::clone(&session);
        self.generations.fetch_add(1, Ordering::SeqCst);

        self.context.status.status(&self.context.name, "loading tests");
        let logger = logger.clone();
        tokio::spawn(async move {
            match session.load().await {
                Ok(()) | Err(ExplorerError::SessionSuperseded) => {}
                Err(e) => logger.debug(format_args!("post-reset load failed: {e}")),
            }
        });
        Ok(())
    }

    /// Terminal. Releases the current generation, then every process-scoped
    /// resource in reverse registration order. Later calls do nothing.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Nothing reaches subscribers once teardown begins
        self.shared.channels.close();
        let _reset = self.reset_lock.lock().await;

        self.logger().info("disposing");
        self.current_session().supersede();
        let session = self.session_scope.dispose_all().await;
        let process = self.process_scope.dispose_all().await;
        tracing::debug!(
            project = %self.context.namespace,
            released = session.released + process.released,
            failed = session.failed + process.failed,
            "orchestrator disposed"
        );
    }

    /// React to changed configuration keys.
    pub async fn configuration_changed<S: AsRef<str>>(
        &self,
        keys: &[S],
    ) -> Result<ConfigChange, ExplorerError> {
        self.ensure_live()?;
        let ours: Vec<&str> = keys
            .iter()
            .map(AsRef::as_ref)
            .filter(|k| is_explorer_key(k))
            .collect();
        if ours.is_empty() {
            return Ok(ConfigChange::Ignored);
        }

        if ours.iter().all(|k| *k == LOG_LEVEL_KEY) {
            if let Ok(settings) = self.settings() {
                self.shared.logger.set_level(settings.log_level);
                return Ok(ConfigChange::LogLevel(settings.log_level));
            }
        }
        self.cancel().await?;
        Ok(ConfigChange::Reset)
    }

    fn show_log(&self) -> Result<Value, ExplorerError> {
        let channel = self.logger().channel_name();
        self.context.status.reveal_log(&channel);

        let records = match &self.log_sink {
            Some(sink) => sink
                .recent(&self.context.namespace, SHOW_LOG_LIMIT)
                .map_err(|e| ExplorerError::Internal(format!("log query failed: {e}")))?,
            None => Vec::new(),
        };
        Ok(json!({ "channel": channel, "records": records }))
    }

    pub fn load_events(&self) -> broadcast::Receiver<LoadEvent> {
        self.shared.channels.load.subscribe()
    }

    pub fn run_events(&self) -> broadcast::Receiver<RunEvent> {
        self.shared.channels.run.subscribe()
    }

    pub fn retire_events(&self) -> broadcast::Receiver<RetireEvent> {
        self.shared.channels.retire.subscribe()
    }

    pub fn channels(&self) -> &Arc<EventChannels> {
        &self.shared.channels
    }

    pub fn generation(&self) -> GenerationId {
        self.session.read().generation().clone()
    }

    /// Sessions built so far, including the current one.
    pub fn generation_count(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn namespace(&self) -> &str {
        &self.context.namespace
    }

    pub fn logger(&self) -> &ProjectLogger {
        &self.shared.logger
    }

    pub fn commands(&self) -> &Arc<CommandRegistry> {
        &self.commands
    }

    pub fn settings(&self) -> Result<ExplorerSettings, ExplorerError> {
        Ok(ExplorerSettings::from_store(self.context.config.as_ref())?)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

fn is_explorer_key(key: &str) -> bool {
    key == SECTION
        || key
            .strip_prefix(SECTION)
            .is_some_and(|rest| rest.starts_with('.'))
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("namespace", &self.context.namespace)
            .field("generation", &self.generation())
            .field("generations", &self.generation_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
