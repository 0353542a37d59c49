use std::time::Duration;

/// Failure raised by a subsystem component (locator, process handler, ...).
#[derive(Clone, Debug, thiserror::Error)]
pub enum ComponentError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("test manifest error: {0}")]
    Manifest(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("unknown test: {0}")]
    UnknownTest(String),
    #[error("port acquisition failed: {0}")]
    Port(String),
    #[error("debugger error: {0}")]
    Debugger(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("component disposed: {0}")]
    Disposed(String),
}

impl ComponentError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::Manifest(_) => "manifest",
            Self::Process(_) => "process",
            Self::UnknownTest(_) => "unknown_test",
            Self::Port(_) => "port",
            Self::Debugger(_) => "debugger",
            Self::Io(_) => "io",
            Self::Timeout(_) => "timeout",
            Self::Disposed(_) => "disposed",
        }
    }
}

impl From<std::io::Error> for ComponentError {
    fn from(e: std::io::Error) -> Self {
        ComponentError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ComponentError {
    fn from(e: serde_json::Error) -> Self {
        ComponentError::Manifest(e.to_string())
    }
}

/// A single resource failed to release.
#[derive(Clone, Debug, thiserror::Error)]
#[error("failed to release {resource}: {reason}")]
pub struct DisposeError {
    pub resource: String,
    pub reason: String,
}

impl DisposeError {
    pub fn new(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}
