use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_telemetry::ProjectLogger;

use super::{ProcessHandler, ProcessOutcome, ProcessRequest};

const NAME: &str = "process-handler";

/// Each child is owned by a tracked supervisor task, so a child outlives an
/// abandoned `execute` call but never outlives `dispose`.
pub struct CommandProcessHandler {
    shutdown: CancellationToken,
    supervisors: TaskTracker,
    active: Arc<AtomicUsize>,
    logger: ProjectLogger,
}

impl CommandProcessHandler {
    pub fn new(logger: ProjectLogger) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            supervisors: TaskTracker::new(),
            active: Arc::new(AtomicUsize::new(0)),
            logger,
        }
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T, ComponentError>
where
    F: Future<Output = T>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| ComponentError::Timeout(t)),
        None => Ok(fut.await),
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Wait for `child` to exit. On shutdown or timeout the child is killed and
/// reaped before this returns.
async fn supervise(
    mut child: Child,
    program: String,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
    logger: ProjectLogger,
) -> Result<ProcessOutcome, ComponentError> {
    let start = Instant::now();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = {
        let collect = async {
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(ComponentError::Disposed(NAME.into())),
            res = with_timeout(timeout, collect) => res,
        }
    };

    match finished {
        Ok((status, stdout, stderr)) => {
            let status = status
                .map_err(|e| ComponentError::Process(format!("waiting for {program}: {e}")))?;
            Ok(ProcessOutcome {
                exit_code: status.code(),
                stdout,
                stderr,
                duration: start.elapsed(),
            })
        }
        Err(e) => {
            if let Err(kill) = child.kill().await {
                logger.warn(format_args!("failed to kill {program}: {kill}"));
            }
            Err(e)
        }
    }
}

#[async_trait]
impl ProcessHandler for CommandProcessHandler {
    async fn execute(&self, request: ProcessRequest) -> Result<ProcessOutcome, ComponentError> {
        if self.shutdown.is_cancelled() {
            return Err(ComponentError::Disposed(NAME.into()));
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .current_dir(&request.cwd)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.logger.debug(format_args!(
            "spawning {} {}",
            request.program,
            request.args.join(" ")
        ));

        let child = cmd.spawn().map_err(|e| {
            ComponentError::Process(format!("failed to spawn {}: {e}", request.program))
        })?;

        let guard = ActiveGuard::enter(&self.active);
        let (tx, rx) = oneshot::channel();
        let shutdown = self.shutdown.clone();
        let logger = self.logger.clone();
        self.supervisors.spawn(async move {
            let _guard = guard;
            let outcome = supervise(child, request.program, request.timeout, shutdown, logger).await;
            let _ = tx.send(outcome);
        });

        rx.await
            .map_err(|_| ComponentError::Process("process supervisor stopped".into()))?
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Disposable for CommandProcessHandler {
    fn name(&self) -> &str {
        NAME
    }

    /// Returns once every child has been killed and reaped.
    async fn dispose(&self) -> Result<(), DisposeError> {
        let live = self.active();
        if live > 0 {
            self.logger.info(format_args!("terminating {live} running process(es)"));
        }
        self.shutdown.cancel();
        self.supervisors.close();
        self.supervisors.wait().await;
        Ok(())
    }
}
