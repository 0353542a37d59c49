//! Scriptable components and collaborators for deterministic lifecycle tests.
//!
//! [`MockFactory`] builds a full [`SubsystemGraph`] whose components record
//! every release into a shared [`MockProbe`], so tests can assert on build
//! counts, release order and per-generation behavior without spawning
//! processes or touching the filesystem.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_core::events::{RetireEvent, RunMode, TestState};
use texplorer_core::host::{DebugTarget, Debugger, NoticeLevel, PortClient, StatusSink};
use texplorer_core::ids::{GenerationId, TestId};
use texplorer_core::tree::TestNode;
use texplorer_settings::ExplorerSettings;

use crate::channels::EventChannels;
use crate::components::{
    FileWatcher, MemoryTestStore, ProcessHandler, ProcessOutcome, ProcessRequest, RunReporter,
    TestLocator, TestManager, TestStore,
};
use crate::error::ExplorerError;
use crate::factory::{ComponentFactory, FactoryContext, SubsystemGraph};

/// A latch tests close to hold work in flight and open to let it finish.
#[derive(Default)]
pub struct Gate {
    closed: AtomicBool,
    notify: Notify,
}

impl Gate {
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub async fn pass(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.closed.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// Shared state observed and programmed by tests.
pub struct MockProbe {
    builds: AtomicUsize,
    build_failure: Mutex<Option<String>>,
    load_failure: Mutex<Option<String>>,
    dispose_failure: Mutex<Option<&'static str>>,
    suite: Mutex<TestNode>,
    generations: Mutex<Vec<GenerationId>>,
    settings: Mutex<Vec<ExplorerSettings>>,
    released: Mutex<Vec<String>>,
    watchers: Mutex<Vec<Arc<MockWatcher>>>,
    runs: Mutex<Vec<(usize, Vec<TestId>, RunMode)>>,
    loads_started: AtomicUsize,
    runs_started: AtomicUsize,
    pub load_gate: Gate,
    pub run_gate: Gate,
}

impl MockProbe {
    fn new(suite: TestNode) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            build_failure: Mutex::new(None),
            load_failure: Mutex::new(None),
            dispose_failure: Mutex::new(None),
            suite: Mutex::new(suite),
            generations: Mutex::new(Vec::new()),
            settings: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            loads_started: AtomicUsize::new(0),
            runs_started: AtomicUsize::new(0),
            load_gate: Gate::default(),
            run_gate: Gate::default(),
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Make subsequent builds fail (`Some`) or succeed again (`None`).
    pub fn fail_builds(&self, message: Option<&str>) {
        *self.build_failure.lock() = message.map(str::to_string);
    }

    pub fn fail_loads(&self, message: Option<&str>) {
        *self.load_failure.lock() = message.map(str::to_string);
    }

    /// Make releasing the named component kind (`process`, `store`, ...) fail.
    pub fn fail_dispose_of(&self, kind: Option<&'static str>) {
        *self.dispose_failure.lock() = kind;
    }

    pub fn set_suite(&self, suite: TestNode) {
        *self.suite.lock() = suite;
    }

    pub fn generations(&self) -> Vec<GenerationId> {
        self.generations.lock().clone()
    }

    /// Settings each build was given, in build order.
    pub fn settings_seen(&self) -> Vec<ExplorerSettings> {
        self.settings.lock().clone()
    }

    /// Released components as `kind#build`, in release order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    pub fn released_from(&self, build: usize) -> Vec<String> {
        let suffix = format!("#{build}");
        self.released()
            .into_iter()
            .filter(|r| r.ends_with(&suffix))
            .collect()
    }

    /// Watcher of the most recent build.
    pub fn latest_watcher(&self) -> Option<Arc<MockWatcher>> {
        self.watchers.lock().last().cloned()
    }

    pub fn watcher(&self, build: usize) -> Option<Arc<MockWatcher>> {
        self.watchers.lock().get(build.checked_sub(1)?).cloned()
    }

    /// `(build, tests, mode)` per run the managers executed.
    pub fn runs(&self) -> Vec<(usize, Vec<TestId>, RunMode)> {
        self.runs.lock().clone()
    }

    pub fn loads_started(&self) -> usize {
        self.loads_started.load(Ordering::SeqCst)
    }

    pub fn runs_started(&self) -> usize {
        self.runs_started.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` loads have entered the manager.
    pub async fn wait_for_loads(&self, n: usize) {
        while self.loads_started() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub async fn wait_for_runs(&self, n: usize) {
        while self.runs_started() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Identity and release bookkeeping shared by every mock component.
struct Handle {
    kind: &'static str,
    label: String,
    build: usize,
    released: AtomicUsize,
    probe: Arc<MockProbe>,
}

impl Handle {
    fn new(kind: &'static str, build: usize, probe: &Arc<MockProbe>) -> Self {
        Self {
            kind,
            label: format!("{kind}#{build}"),
            build,
            released: AtomicUsize::new(0),
            probe: Arc::clone(probe),
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst) > 0
    }

    fn release(&self) -> Result<(), DisposeError> {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.probe.released.lock().push(self.label.clone());
        if *self.probe.dispose_failure.lock() == Some(self.kind) {
            return Err(DisposeError::new(self.label.clone(), "scripted failure"));
        }
        Ok(())
    }
}

macro_rules! mock_disposable {
    ($ty:ty) => {
        #[async_trait]
        impl Disposable for $ty {
            fn name(&self) -> &str {
                &self.handle.label
            }

            async fn dispose(&self) -> Result<(), DisposeError> {
                self.handle.release()
            }
        }

        impl $ty {
            pub fn release_count(&self) -> usize {
                self.handle.released.load(Ordering::SeqCst)
            }
        }
    };
}

pub struct MockProcess {
    handle: Handle,
}

#[async_trait]
impl ProcessHandler for MockProcess {
    async fn execute(&self, _request: ProcessRequest) -> Result<ProcessOutcome, ComponentError> {
        Ok(ProcessOutcome {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }

    fn active(&self) -> usize {
        0
    }
}

mock_disposable!(MockProcess);

pub struct MockLocator {
    handle: Handle,
}

#[async_trait]
impl TestLocator for MockLocator {
    async fn locate(&self) -> Result<TestNode, ComponentError> {
        if let Some(msg) = self.handle.probe.load_failure.lock().clone() {
            return Err(ComponentError::Manifest(msg));
        }
        Ok(self.handle.probe.suite.lock().clone())
    }

    fn sources(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

mock_disposable!(MockLocator);

pub struct MockStore {
    handle: Handle,
    inner: MemoryTestStore,
}

impl TestStore for MockStore {
    fn replace(&self, root: TestNode) {
        self.inner.replace(root)
    }

    fn root(&self) -> Option<TestNode> {
        self.inner.root()
    }

    fn get(&self, id: &TestId) -> Option<TestNode> {
        self.inner.get(id)
    }

    fn tests_in_file(&self, path: &Path) -> Vec<TestId> {
        self.inner.tests_in_file(path)
    }

    fn record(&self, id: &TestId, state: TestState) {
        self.inner.record(id, state)
    }

    fn last_state(&self, id: &TestId) -> Option<TestState> {
        self.inner.last_state(id)
    }
}

mock_disposable!(MockStore);

/// Passes every known test; unknown ids are reported errored.
pub struct MockManager {
    handle: Handle,
    locator: Arc<MockLocator>,
    store: Arc<MockStore>,
}

#[async_trait]
impl TestManager for MockManager {
    async fn load_tests(&self) -> Result<TestNode, ComponentError> {
        let probe = &self.handle.probe;
        probe.loads_started.fetch_add(1, Ordering::SeqCst);
        probe.load_gate.pass().await;
        if self.handle.is_released() {
            return Err(ComponentError::Disposed(self.handle.label.clone()));
        }
        let root = self.locator.locate().await?;
        self.store.replace(root.clone());
        Ok(root)
    }

    async fn run_tests(
        &self,
        tests: &[TestId],
        mode: RunMode,
        reporter: &RunReporter,
    ) -> Result<(), ComponentError> {
        let probe = &self.handle.probe;
        probe.runs_started.fetch_add(1, Ordering::SeqCst);
        probe.run_gate.pass().await;
        if self.handle.is_released() {
            return Err(ComponentError::Disposed(self.handle.label.clone()));
        }
        probe
            .runs
            .lock()
            .push((self.handle.build, tests.to_vec(), mode));

        let root = self
            .store
            .root()
            .unwrap_or_else(|| probe.suite.lock().clone());
        for id in tests {
            match root.find(id) {
                Some(node) => {
                    for leaf in node.leaves() {
                        self.store.record(&leaf.id, TestState::Passed);
                        reporter.test(&leaf.id, TestState::Passed, None, None);
                    }
                }
                None => reporter.test(
                    id,
                    TestState::Errored,
                    Some(format!("unknown test: {id}")),
                    None,
                ),
            }
        }
        Ok(())
    }
}

mock_disposable!(MockManager);

/// Watcher that publishes only when a test calls [`MockWatcher::touch`].
pub struct MockWatcher {
    handle: Handle,
    channels: Arc<EventChannels>,
}

impl MockWatcher {
    pub fn build(&self) -> usize {
        self.handle.build
    }

    /// Simulate a change to files defining `tests` (`None` = everything).
    /// A released watcher stays silent.
    pub fn touch(&self, tests: Option<Vec<TestId>>) -> bool {
        if self.handle.is_released() {
            return false;
        }
        self.channels.retire.emit(RetireEvent { tests });
        true
    }
}

impl FileWatcher for MockWatcher {
    fn is_watching(&self) -> bool {
        !self.handle.is_released()
    }
}

mock_disposable!(MockWatcher);

/// [`ComponentFactory`] producing mock graphs, one numbered build at a time.
#[derive(Clone)]
pub struct MockFactory {
    probe: Arc<MockProbe>,
}

impl MockFactory {
    pub fn new(suite: TestNode) -> Self {
        Self {
            probe: Arc::new(MockProbe::new(suite)),
        }
    }

    pub fn probe(&self) -> Arc<MockProbe> {
        Arc::clone(&self.probe)
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new(sample_suite())
    }
}

/// `root > math > {math::add, math::sub}`, plus `io::read`.
pub fn sample_suite() -> TestNode {
    TestNode::suite(
        "root",
        "root",
        vec![
            TestNode::suite(
                "math",
                "math",
                vec![
                    TestNode::test("math::add", "add"),
                    TestNode::test("math::sub", "sub"),
                ],
            )
            .with_file("src/math.rs"),
            TestNode::test("io::read", "read").with_file("src/io.rs"),
        ],
    )
}

#[async_trait]
impl ComponentFactory for MockFactory {
    async fn build(&self, ctx: &FactoryContext<'_>) -> Result<SubsystemGraph, ExplorerError> {
        let probe = &self.probe;
        let build = probe.builds.fetch_add(1, Ordering::SeqCst) + 1;
        probe.generations.lock().push(ctx.generation.clone());
        probe.settings.lock().push(ctx.settings.clone());

        if let Some(msg) = probe.build_failure.lock().clone() {
            return Err(ExplorerError::Factory(msg));
        }

        let locator = Arc::new(MockLocator {
            handle: Handle::new("locator", build, probe),
        });
        let store = Arc::new(MockStore {
            handle: Handle::new("store", build, probe),
            inner: MemoryTestStore::new(ctx.cwd()),
        });
        let manager = Arc::new(MockManager {
            handle: Handle::new("manager", build, probe),
            locator: Arc::clone(&locator),
            store: Arc::clone(&store),
        });
        let watcher = Arc::new(MockWatcher {
            handle: Handle::new("watcher", build, probe),
            channels: Arc::clone(&ctx.shared.channels),
        });
        probe.watchers.lock().push(Arc::clone(&watcher));

        Ok(SubsystemGraph {
            process: Arc::new(MockProcess {
                handle: Handle::new("process", build, probe),
            }),
            locator,
            store,
            manager,
            watcher,
        })
    }
}

/// Port client handing out sequential ports from a base.
pub struct MockPortClient {
    next: AtomicU16,
    acquired: Mutex<Vec<u16>>,
    released: Mutex<Vec<u16>>,
    disposed: AtomicUsize,
}

impl MockPortClient {
    pub fn new(base: u16) -> Self {
        Self {
            next: AtomicU16::new(base),
            acquired: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            disposed: AtomicUsize::new(0),
        }
    }

    pub fn acquired(&self) -> Vec<u16> {
        self.acquired.lock().clone()
    }

    pub fn released(&self) -> Vec<u16> {
        self.released.lock().clone()
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortClient for MockPortClient {
    async fn acquire(&self) -> Result<u16, ComponentError> {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        self.acquired.lock().push(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.released.lock().push(port);
    }
}

#[async_trait]
impl Disposable for MockPortClient {
    fn name(&self) -> &str {
        "port-client"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockDebugger {
    namespace: String,
    attaches: Mutex<Vec<DebugTarget>>,
    fail: AtomicBool,
    disposed: AtomicUsize,
}

impl MockDebugger {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            attaches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            disposed: AtomicUsize::new(0),
        }
    }

    pub fn attaches(&self) -> Vec<DebugTarget> {
        self.attaches.lock().clone()
    }

    pub fn fail_attaches(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Debugger for MockDebugger {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn attach(&self, target: &DebugTarget) -> Result<(), ComponentError> {
        self.attaches.lock().push(target.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ComponentError::Debugger("no debug adapter".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Disposable for MockDebugger {
    fn name(&self) -> &str {
        "debugger"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.disposed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records everything shown to the user.
#[derive(Default)]
pub struct MockStatusSink {
    statuses: Mutex<Vec<(String, String)>>,
    notices: Mutex<Vec<(NoticeLevel, String)>>,
    revealed: Mutex<Vec<String>>,
}

impl MockStatusSink {
    pub fn statuses(&self) -> Vec<(String, String)> {
        self.statuses.lock().clone()
    }

    pub fn notices(&self) -> Vec<(NoticeLevel, String)> {
        self.notices.lock().clone()
    }

    pub fn revealed(&self) -> Vec<String> {
        self.revealed.lock().clone()
    }
}

impl StatusSink for MockStatusSink {
    fn status(&self, project: &str, text: &str) {
        self.statuses
            .lock()
            .push((project.to_string(), text.to_string()));
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        self.notices.lock().push((level, message.to_string()));
    }

    fn reveal_log(&self, channel: &str) {
        self.revealed.lock().push(channel.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_holds_until_opened() {
        let gate = Arc::new(Gate::default());
        gate.close();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.pass().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        gate.open();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn open_gate_passes_immediately() {
        Gate::default().pass().await;
    }

    #[tokio::test]
    async fn handles_record_release_order_and_failures() {
        let factory = MockFactory::default();
        let probe = factory.probe();
        probe.fail_dispose_of(Some("store"));

        let handle = Handle::new("store", 3, &probe);
        assert!(handle.release().is_err());
        assert_eq!(probe.released(), vec!["store#3"]);
        assert_eq!(probe.released_from(3), vec!["store#3"]);
        assert!(probe.released_from(1).is_empty());
    }
}
