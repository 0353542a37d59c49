use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use texplorer_core::dispose::Disposable;
use texplorer_core::errors::DisposeError;
use texplorer_core::level::LogLevel;

struct Shared {
    project: String,
    level: AtomicU8,
    closed: AtomicBool,
}

/// Per-project logger. Cheap to clone; `component()` derives loggers that
/// share the project's level, so `set_level` applies to all of them at once.
#[derive(Clone)]
pub struct ProjectLogger {
    shared: Arc<Shared>,
    component: Arc<str>,
}

impl ProjectLogger {
    pub fn new(project: impl Into<String>, level: LogLevel) -> Self {
        Self {
            shared: Arc::new(Shared {
                project: project.into(),
                level: AtomicU8::new(level.to_u8()),
                closed: AtomicBool::new(false),
            }),
            component: Arc::from("explorer"),
        }
    }

    pub fn component(&self, name: &str) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            component: Arc::from(name),
        }
    }

    pub fn project(&self) -> &str {
        &self.shared.project
    }

    pub fn component_name(&self) -> &str {
        &self.component
    }

    /// Name of the host-visible log channel for this project.
    pub fn channel_name(&self) -> String {
        format!("Test Explorer ({})", self.shared.project)
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.shared.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.shared.level.store(level.to_u8(), Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        !self.is_closed() && self.level().enables(level)
    }

    pub fn trace(&self, msg: impl Display) {
        self.log(LogLevel::Trace, msg);
    }

    pub fn debug(&self, msg: impl Display) {
        self.log(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: impl Display) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.log(LogLevel::Warn, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.log(LogLevel::Error, msg);
    }

    pub fn log(&self, level: LogLevel, msg: impl Display) {
        if !self.enabled(level) {
            return;
        }
        let project = self.shared.project.as_str();
        let component = &*self.component;
        match level {
            LogLevel::Trace => tracing::trace!(project, component, "{msg}"),
            LogLevel::Debug => tracing::debug!(project, component, "{msg}"),
            LogLevel::Info => tracing::info!(project, component, "{msg}"),
            LogLevel::Warn => tracing::warn!(project, component, "{msg}"),
            LogLevel::Error => tracing::error!(project, component, "{msg}"),
            LogLevel::Off => {}
        }
    }
}

impl std::fmt::Debug for ProjectLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLogger")
            .field("project", &self.shared.project)
            .field("component", &&*self.component)
            .field("level", &self.level())
            .finish()
    }
}

#[async_trait]
impl Disposable for ProjectLogger {
    fn name(&self) -> &str {
        "logger"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}
