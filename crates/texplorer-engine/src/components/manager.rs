use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_core::events::{RunMode, SuiteState, TestState};
use texplorer_core::host::{DebugTarget, Debugger, PortClient, PortLease};
use texplorer_core::ids::TestId;
use texplorer_core::tree::TestNode;
use texplorer_settings::{DebugSettings, RunnerSettings};
use texplorer_telemetry::ProjectLogger;

use super::{ProcessHandler, ProcessOutcome, ProcessRequest, RunReporter, TestLocator, TestStore};

/// Lines of child output kept in a failure message.
const FAILURE_TAIL_LINES: usize = 20;

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub cwd: PathBuf,
    pub runner: RunnerSettings,
    pub debug: DebugSettings,
}

/// Runs each requested test as its own runner invocation.
pub struct RunnerTestManager {
    config: RunnerConfig,
    process: Arc<dyn ProcessHandler>,
    locator: Arc<dyn TestLocator>,
    store: Arc<dyn TestStore>,
    ports: Arc<dyn PortClient>,
    debugger: Arc<dyn Debugger>,
    disposed: AtomicBool,
    logger: ProjectLogger,
}

/// What a run request expands to against the current tree.
#[derive(Debug, Default)]
struct RunPlan {
    suites: Vec<TestId>,
    leaves: Vec<TestId>,
    unknown: Vec<TestId>,
    files: HashMap<TestId, PathBuf>,
}

fn plan_run(root: &TestNode, requested: &[TestId]) -> RunPlan {
    let mut plan = RunPlan {
        files: root.files_with_tests().into_iter().map(|(f, id)| (id, f)).collect(),
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for id in requested {
        let Some(node) = root.find(id) else {
            plan.unknown.push(id.clone());
            continue;
        };
        if node.is_suite() {
            plan.suites.push(id.clone());
        }
        for leaf in node.leaves() {
            if seen.insert(leaf.id.clone()) {
                plan.leaves.push(leaf.id.clone());
            }
        }
    }
    plan
}

fn substitute(template: &str, test: &TestId, file: Option<&PathBuf>, port: Option<u16>) -> String {
    let mut out = template.replace("{test}", test.as_str());
    if let Some(file) = file {
        out = out.replace("{file}", &file.to_string_lossy());
    }
    if let Some(port) = port {
        out = out.replace("{port}", &port.to_string());
    }
    out
}

fn failure_message(outcome: &ProcessOutcome) -> String {
    let status = match outcome.exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };
    let output = if outcome.stderr.trim().is_empty() {
        &outcome.stdout
    } else {
        &outcome.stderr
    };
    let lines: Vec<&str> = output.lines().collect();
    let tail = lines[lines.len().saturating_sub(FAILURE_TAIL_LINES)..].join("\n");
    if tail.trim().is_empty() {
        status
    } else {
        format!("{status}\n{tail}")
    }
}

impl RunnerTestManager {
    pub fn new(
        config: RunnerConfig,
        process: Arc<dyn ProcessHandler>,
        locator: Arc<dyn TestLocator>,
        store: Arc<dyn TestStore>,
        ports: Arc<dyn PortClient>,
        debugger: Arc<dyn Debugger>,
        logger: ProjectLogger,
    ) -> Self {
        Self {
            config,
            process,
            locator,
            store,
            ports,
            debugger,
            disposed: AtomicBool::new(false),
            logger,
        }
    }

    fn ensure_live(&self) -> Result<(), ComponentError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ComponentError::Disposed("test-manager".into()));
        }
        Ok(())
    }

    fn request_for(&self, test: &TestId, file: Option<&PathBuf>, port: Option<u16>) -> ProcessRequest {
        let runner = &self.config.runner;
        let mut args: Vec<String> = runner
            .args
            .iter()
            .map(|a| substitute(a, test, file, port))
            .collect();
        let mut env: Vec<(String, String)> = runner
            .env
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, test, file, port)))
            .collect();

        if let Some(port) = port {
            args.extend(
                self.config
                    .debug
                    .args
                    .iter()
                    .map(|a| substitute(a, test, file, Some(port))),
            );
            if let Some(var) = &self.config.debug.port_env {
                env.push((var.clone(), port.to_string()));
            }
        }

        ProcessRequest {
            program: runner.command.clone(),
            args,
            cwd: self.config.cwd.clone(),
            env,
            timeout: runner.timeout_ms.map(Duration::from_millis),
        }
    }

    async fn spawn_one(
        &self,
        request: ProcessRequest,
        test: &TestId,
        port: Option<u16>,
    ) -> Result<ProcessOutcome, ComponentError> {
        let Some(port) = port else {
            return self.process.execute(request).await;
        };

        let target = DebugTarget {
            host: self.config.debug.host.clone(),
            port,
            cwd: self.config.cwd.clone(),
            tests: vec![test.clone()],
        };
        let exec = self.process.execute(request);
        tokio::pin!(exec);

        let attached = tokio::select! {
            biased;
            attached = self.debugger.attach(&target) => attached,
            outcome = &mut exec => return outcome,
        };
        match attached {
            Ok(()) => exec.await,
            // Dropping `exec` terminates the child waiting for a debugger
            Err(e) => Err(e),
        }
    }

    async fn execute_one(
        &self,
        test: &TestId,
        file: Option<&PathBuf>,
        port: Option<u16>,
        reporter: &RunReporter,
    ) -> Result<(), ComponentError> {
        reporter.test(test, TestState::Running, None, None);
        let request = self.request_for(test, file, port);

        match self.spawn_one(request, test, port).await {
            Ok(outcome) => {
                let (state, message) = if outcome.success() {
                    (TestState::Passed, None)
                } else {
                    (TestState::Failed, Some(failure_message(&outcome)))
                };
                self.store.record(test, state);
                reporter.test(test, state, message, Some(outcome.duration));
                Ok(())
            }
            Err(e @ ComponentError::Disposed(_)) => Err(e),
            Err(e) => {
                self.logger.warn(format_args!("{test}: {e}"));
                self.store.record(test, TestState::Errored);
                reporter.test(test, TestState::Errored, Some(e.to_string()), None);
                Ok(())
            }
        }
    }

    async fn execute_plan(
        &self,
        plan: &RunPlan,
        port: Option<u16>,
        reporter: &RunReporter,
    ) -> Result<(), ComponentError> {
        for test in &plan.leaves {
            self.ensure_live()?;
            self.execute_one(test, plan.files.get(test), port, reporter)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl super::TestManager for RunnerTestManager {
    async fn load_tests(&self) -> Result<TestNode, ComponentError> {
        self.ensure_live()?;
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
        self.ensure_live()?;
        let root = match self.store.root() {
            Some(root) => root,
            None => self.load_tests().await?,
        };

        let plan = plan_run(&root, tests);
        for id in &plan.unknown {
            reporter.test(id, TestState::Errored, Some(format!("unknown test: {id}")), None);
        }
        if plan.leaves.is_empty() {
            return Ok(());
        }

        let lease = match mode {
            RunMode::Run => None,
            RunMode::Debug => Some(PortLease::acquire(&self.ports).await?),
        };
        let port = lease.as_ref().map(PortLease::port);

        for suite in &plan.suites {
            reporter.suite(suite, SuiteState::Running);
        }
        self.logger.info(format_args!(
            "{} {} test(s)",
            if port.is_some() { "debugging" } else { "running" },
            plan.leaves.len()
        ));

        let result = self.execute_plan(&plan, port, reporter).await;
        drop(lease);

        let suite_state = if result.is_ok() {
            SuiteState::Completed
        } else {
            SuiteState::Errored
        };
        for suite in &plan.suites {
            reporter.suite(suite, suite_state);
        }
        result
    }
}

#[async_trait]
impl Disposable for RunnerTestManager {
    fn name(&self) -> &str {
        "test-manager"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::EventChannels;
    use crate::components::{MemoryTestStore, TestManager};
    use crate::mock::{MockDebugger, MockPortClient};
    use parking_lot::Mutex;
    use texplorer_core::events::RunEvent;
    use texplorer_core::ids::RunId;
    use texplorer_core::level::LogLevel;
    use tokio::sync::broadcast::Receiver;

    /// Fails any invocation whose args mention a test id containing "bad".
    struct ScriptedProcess {
        requests: Mutex<Vec<ProcessRequest>>,
    }

    #[async_trait]
    impl ProcessHandler for ScriptedProcess {
        async fn execute(&self, request: ProcessRequest) -> Result<ProcessOutcome, ComponentError> {
            let bad = request.args.iter().any(|a| a.contains("bad"));
            let broken = request.args.iter().any(|a| a.contains("broken"));
            let hang = request.args.iter().any(|a| a.contains("hang"));
            self.requests.lock().push(request);
            if hang {
                std::future::pending::<()>().await;
            }
            if broken {
                return Err(ComponentError::Process("spawn failed".into()));
            }
            Ok(ProcessOutcome {
                exit_code: Some(if bad { 101 } else { 0 }),
                stdout: String::new(),
                stderr: if bad { "assertion failed".into() } else { String::new() },
                duration: Duration::from_millis(5),
            })
        }

        fn active(&self) -> usize {
            0
        }
    }

    #[async_trait]
    impl Disposable for ScriptedProcess {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn dispose(&self) -> Result<(), DisposeError> {
            Ok(())
        }
    }

    struct FixedLocator(TestNode);

    #[async_trait]
    impl TestLocator for FixedLocator {
        async fn locate(&self) -> Result<TestNode, ComponentError> {
            Ok(self.0.clone())
        }
        fn sources(&self) -> Vec<PathBuf> {
            Vec::new()
        }
    }

    #[async_trait]
    impl Disposable for FixedLocator {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn dispose(&self) -> Result<(), DisposeError> {
            Ok(())
        }
    }

    struct Fixture {
        manager: RunnerTestManager,
        process: Arc<ScriptedProcess>,
        store: Arc<MemoryTestStore>,
        ports: Arc<MockPortClient>,
        debugger: Arc<MockDebugger>,
        channels: Arc<EventChannels>,
    }

    fn tree() -> TestNode {
        TestNode::suite(
            "root",
            "root",
            vec![TestNode::suite(
                "math",
                "math",
                vec![
                    TestNode::test("math::good", "good"),
                    TestNode::test("math::bad", "bad"),
                ],
            )
            .with_file("src/math.rs")],
        )
    }

    fn fixture() -> Fixture {
        let process = Arc::new(ScriptedProcess {
            requests: Mutex::new(Vec::new()),
        });
        let store = Arc::new(MemoryTestStore::new("/work"));
        let ports = Arc::new(MockPortClient::new(9229));
        let debugger = Arc::new(MockDebugger::new("texplorer.demo"));
        let config = RunnerConfig {
            cwd: PathBuf::from("/work"),
            runner: RunnerSettings {
                command: "runner".into(),
                args: vec!["--file={file}".into(), "{test}".into()],
                ..Default::default()
            },
            debug: DebugSettings {
                args: vec!["--inspect={port}".into()],
                ..Default::default()
            },
        };
        let manager = RunnerTestManager::new(
            config,
            process.clone(),
            Arc::new(FixedLocator(tree())),
            store.clone(),
            ports.clone(),
            debugger.clone(),
            ProjectLogger::new("demo", LogLevel::Off),
        );
        Fixture {
            manager,
            process,
            store,
            ports,
            debugger,
            channels: Arc::new(EventChannels::default()),
        }
    }

    fn drain(rx: &mut Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn final_states(events: &[RunEvent]) -> HashMap<String, TestState> {
        events
            .iter()
            .filter_map(|e| match e {
                RunEvent::Test { test, state, .. } if *state != TestState::Running => {
                    Some((test.to_string(), *state))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plan_expands_suites_and_dedupes() {
        let plan = plan_run(
            &tree(),
            &[TestId::new("math"), TestId::new("math::good"), TestId::new("nope")],
        );
        assert_eq!(plan.suites, vec![TestId::new("math")]);
        assert_eq!(
            plan.leaves,
            vec![TestId::new("math::good"), TestId::new("math::bad")]
        );
        assert_eq!(plan.unknown, vec![TestId::new("nope")]);
        assert_eq!(
            plan.files.get(&TestId::new("math::bad")),
            Some(&PathBuf::from("src/math.rs"))
        );
    }

    #[test]
    fn failure_message_prefers_stderr_tail() {
        let outcome = ProcessOutcome {
            exit_code: Some(1),
            stdout: "noise".into(),
            stderr: (0..30).map(|i| format!("line {i}\n")).collect(),
            duration: Duration::ZERO,
        };
        let msg = failure_message(&outcome);
        assert!(msg.starts_with("exit code 1\n"));
        assert!(msg.contains("line 29"));
        assert!(!msg.contains("line 9\n"));
    }

    #[tokio::test]
    async fn load_populates_store() {
        let f = fixture();
        let root = f.manager.load_tests().await.unwrap();
        assert_eq!(root, tree());
        assert_eq!(f.store.root(), Some(tree()));
    }

    #[tokio::test]
    async fn run_reports_pass_and_fail() {
        let f = fixture();
        let mut rx = f.channels.run.subscribe();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        f.manager
            .run_tests(&[TestId::new("math")], RunMode::Run, &reporter)
            .await
            .unwrap();

        let events = drain(&mut rx);
        let states = final_states(&events);
        assert_eq!(states["math::good"], TestState::Passed);
        assert_eq!(states["math::bad"], TestState::Failed);
        assert!(matches!(
            events.first(),
            Some(RunEvent::Suite { state: SuiteState::Running, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(RunEvent::Suite { state: SuiteState::Completed, .. })
        ));
        assert_eq!(
            f.store.last_state(&TestId::new("math::bad")),
            Some(TestState::Failed)
        );

        let requests = f.process.requests.lock();
        assert_eq!(requests[0].program, "runner");
        assert_eq!(requests[0].args, vec!["--file=src/math.rs", "math::good"]);
        assert!(f.ports.acquired().is_empty());
    }

    #[tokio::test]
    async fn unknown_tests_are_errored_not_fatal() {
        let f = fixture();
        let mut rx = f.channels.run.subscribe();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        f.manager
            .run_tests(&[TestId::new("ghost")], RunMode::Run, &reporter)
            .await
            .unwrap();

        let states = final_states(&drain(&mut rx));
        assert_eq!(states["ghost"], TestState::Errored);
        assert!(f.process.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn process_errors_mark_test_errored() {
        let f = fixture();
        f.store.replace(TestNode::suite(
            "root",
            "root",
            vec![TestNode::test("broken", "broken")],
        ));
        let mut rx = f.channels.run.subscribe();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        f.manager
            .run_tests(&[TestId::new("broken")], RunMode::Run, &reporter)
            .await
            .unwrap();

        assert_eq!(final_states(&drain(&mut rx))["broken"], TestState::Errored);
    }

    #[tokio::test]
    async fn debug_acquires_port_and_attaches() {
        let f = fixture();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        f.manager
            .run_tests(&[TestId::new("math::good")], RunMode::Debug, &reporter)
            .await
            .unwrap();

        assert_eq!(f.ports.acquired(), vec![9229]);
        assert_eq!(f.ports.released(), vec![9229]);
        let attaches = f.debugger.attaches();
        assert_eq!(attaches.len(), 1);
        assert_eq!(attaches[0].port, 9229);
        assert_eq!(attaches[0].tests, vec![TestId::new("math::good")]);

        let requests = f.process.requests.lock();
        assert!(requests[0].args.contains(&"--inspect=9229".to_string()));
        assert!(requests[0]
            .env
            .contains(&("TEXPLORER_DEBUG_PORT".to_string(), "9229".to_string())));
    }

    #[tokio::test]
    async fn failed_attach_errors_the_test() {
        let f = fixture();
        f.debugger.fail_attaches(true);
        let mut rx = f.channels.run.subscribe();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        f.manager
            .run_tests(&[TestId::new("math::good")], RunMode::Debug, &reporter)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(final_states(&events)["math::good"], TestState::Errored);
        assert_eq!(f.ports.released(), vec![9229]);
    }

    #[tokio::test]
    async fn abandoned_debug_run_returns_its_port() {
        let f = fixture();
        f.store.replace(TestNode::suite(
            "root",
            "root",
            vec![TestNode::test("hang", "hang")],
        ));
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            f.manager
                .run_tests(&[TestId::new("hang")], RunMode::Debug, &reporter),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(f.ports.acquired(), vec![9229]);
        assert_eq!(f.ports.released(), vec![9229]);
    }

    #[tokio::test]
    async fn disposed_manager_refuses_work() {
        let f = fixture();
        f.manager.dispose().await.unwrap();
        let reporter = RunReporter::new(RunId::new(), f.channels.clone());
        assert!(matches!(
            f.manager.load_tests().await,
            Err(ComponentError::Disposed(_))
        ));
        assert!(matches!(
            f.manager
                .run_tests(&[TestId::new("math")], RunMode::Run, &reporter)
                .await,
            Err(ComponentError::Disposed(_))
        ));
    }
}
