use texplorer_core::errors::ComponentError;
use texplorer_settings::SettingsError;

#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
    #[error("component error: {0}")]
    Component(#[from] ComponentError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("failed to construct subsystems: {0}")]
    Factory(String),

    #[error("malformed test id: {0:?}")]
    MalformedTestId(String),

    /// The session this call was bound to was replaced by a reset.
    #[error("session superseded by a reset")]
    SessionSuperseded,

    /// The explorer was used after `dispose()`.
    #[error("explorer already disposed")]
    Disposed,

    #[error("{0}")]
    Internal(String),
}

impl ExplorerError {
    /// Short classification string for logging and RPC error payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Component(e) => e.error_kind(),
            Self::Settings(_) => "settings",
            Self::Factory(_) => "factory",
            Self::MalformedTestId(_) => "malformed_test_id",
            Self::SessionSuperseded => "session_superseded",
            Self::Disposed => "disposed",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_errors_keep_their_kind() {
        let err: ExplorerError = ComponentError::Process("exit 101".into()).into();
        assert_eq!(err.error_kind(), "process");
        assert_eq!(err.to_string(), "component error: process error: exit 101");
    }

    #[test]
    fn lifecycle_errors_are_distinguished() {
        assert_eq!(ExplorerError::Disposed.error_kind(), "disposed");
        assert_eq!(ExplorerError::SessionSuperseded.error_kind(), "session_superseded");
        assert!(ExplorerError::MalformedTestId(" x".into()).to_string().contains("\" x\""));
    }
}
