//! The five subsystem components a session is wired from.
//!
//! Every component is [`Disposable`]; a factory builds one of each per
//! generation and the session-scoped registry releases them together.

pub mod locator;
pub mod manager;
pub mod process;
pub mod store;
pub mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::ComponentError;
use texplorer_core::events::{RunEvent, RunMode, SuiteState, TestState};
use texplorer_core::ids::{RunId, TestId};
use texplorer_core::tree::TestNode;

use crate::channels::EventChannels;

pub use locator::ManifestLocator;
pub use manager::{RunnerConfig, RunnerTestManager};
pub use process::CommandProcessHandler;
pub use store::MemoryTestStore;
pub use watcher::{NotifyFileWatcher, WatchConfig, WatchFilter};

/// A child process invocation.
#[derive(Clone, Debug, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug)]
pub struct ProcessOutcome {
    /// `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Spawns and tracks child processes. Disposal terminates live children.
#[async_trait]
pub trait ProcessHandler: Disposable {
    async fn execute(&self, request: ProcessRequest) -> Result<ProcessOutcome, ComponentError>;

    /// Children currently running.
    fn active(&self) -> usize;
}

/// Discovers the test tree.
#[async_trait]
pub trait TestLocator: Disposable {
    async fn locate(&self) -> Result<TestNode, ComponentError>;

    /// Files whose modification invalidates the whole tree.
    fn sources(&self) -> Vec<PathBuf>;
}

/// Holds the last discovered tree and the latest result per test.
pub trait TestStore: Disposable {
    fn replace(&self, root: TestNode);

    fn root(&self) -> Option<TestNode>;

    fn get(&self, id: &TestId) -> Option<TestNode>;

    /// Tests defined in `path`, including those inheriting it from a suite.
    fn tests_in_file(&self, path: &Path) -> Vec<TestId>;

    fn record(&self, id: &TestId, state: TestState);

    fn last_state(&self, id: &TestId) -> Option<TestState>;
}

/// Loads and executes tests, reporting progress on the run channel.
#[async_trait]
pub trait TestManager: Disposable {
    async fn load_tests(&self) -> Result<TestNode, ComponentError>;

    /// Failing tests are reported, not returned as errors. An error means the
    /// run itself could not proceed.
    async fn run_tests(
        &self,
        tests: &[TestId],
        mode: RunMode,
        reporter: &RunReporter,
    ) -> Result<(), ComponentError>;
}

/// Watches project files and publishes retire events on change.
pub trait FileWatcher: Disposable {
    fn is_watching(&self) -> bool;
}

/// Publishes per-suite and per-test progress for one run.
#[derive(Clone)]
pub struct RunReporter {
    run_id: RunId,
    channels: Arc<EventChannels>,
}

impl RunReporter {
    pub fn new(run_id: RunId, channels: Arc<EventChannels>) -> Self {
        Self { run_id, channels }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn suite(&self, suite: &TestId, state: SuiteState) {
        self.channels.run.emit(RunEvent::Suite {
            run_id: self.run_id.clone(),
            suite: suite.clone(),
            state,
        });
    }

    pub fn test(
        &self,
        test: &TestId,
        state: TestState,
        message: Option<String>,
        duration: Option<Duration>,
    ) {
        self.channels.run.emit(RunEvent::Test {
            run_id: self.run_id.clone(),
            test: test.clone(),
            state,
            message,
            duration_ms: duration.map(|d| d.as_millis() as u64),
        });
    }
}
