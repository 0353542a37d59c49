//! Collaborators the standalone server supplies when no editor host is around.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_core::host::{DebugTarget, Debugger, NoticeLevel, PortClient, PortManager, StatusSink};

const MAX_PORT_ATTEMPTS: usize = 16;

/// Hands every project its own [`LocalPortClient`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalPortManager;

impl PortManager for LocalPortManager {
    fn client(&self, namespace: &str) -> Arc<dyn PortClient> {
        Arc::new(LocalPortClient::new(namespace))
    }
}

/// Finds free loopback ports by binding to port 0. Ports stay leased until
/// released so one client never hands out the same port twice.
pub struct LocalPortClient {
    namespace: String,
    leased: Mutex<HashSet<u16>>,
    closed: AtomicBool,
}

impl LocalPortClient {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            leased: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn leased(&self) -> usize {
        self.leased.lock().len()
    }
}

#[async_trait]
impl PortClient for LocalPortClient {
    async fn acquire(&self) -> Result<u16, ComponentError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ComponentError::Disposed("port-client".into()));
        }
        for _ in 0..MAX_PORT_ATTEMPTS {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
                .await
                .map_err(|e| ComponentError::Port(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| ComponentError::Port(e.to_string()))?
                .port();
            drop(listener);
            if self.leased.lock().insert(port) {
                tracing::debug!(namespace = %self.namespace, port, "port leased");
                return Ok(port);
            }
        }
        Err(ComponentError::Port(format!(
            "no free port after {MAX_PORT_ATTEMPTS} attempts"
        )))
    }

    fn release(&self, port: u16) {
        self.leased.lock().remove(&port);
    }
}

#[async_trait]
impl Disposable for LocalPortClient {
    fn name(&self) -> &str {
        "port-client"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.closed.store(true, Ordering::Release);
        self.leased.lock().clear();
        Ok(())
    }
}

/// Routes status and notices into the process log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn status(&self, project: &str, text: &str) {
        tracing::info!(project, status = text, "status");
    }

    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => tracing::info!("{message}"),
            NoticeLevel::Warning => tracing::warn!("{message}"),
            NoticeLevel::Error => tracing::error!("{message}"),
        }
    }

    fn reveal_log(&self, channel: &str) {
        tracing::info!(channel, "log channel requested");
    }
}

/// Debugger that cannot attach by itself; it tells the user where to.
pub struct NoticeDebugger {
    namespace: String,
    status: Arc<dyn StatusSink>,
    closed: AtomicBool,
}

impl NoticeDebugger {
    pub fn new(namespace: impl Into<String>, status: Arc<dyn StatusSink>) -> Self {
        Self {
            namespace: namespace.into(),
            status,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Debugger for NoticeDebugger {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn attach(&self, target: &DebugTarget) -> Result<(), ComponentError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ComponentError::Disposed("debugger".into()));
        }
        self.status.notify(
            NoticeLevel::Info,
            &format!(
                "{}: attach a debugger to {}:{} ({} test(s))",
                self.namespace,
                target.host,
                target.port,
                target.tests.len()
            ),
        );
        Ok(())
    }
}

#[async_trait]
impl Disposable for NoticeDebugger {
    fn name(&self) -> &str {
        "debugger"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
