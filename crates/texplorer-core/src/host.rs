//! Collaborators supplied by the host environment.
//!
//! The explorer never constructs these itself beyond thin local defaults;
//! the host hands them in at project construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispose::Disposable;
use crate::errors::ComponentError;
use crate::ids::TestId;

/// Configuration store keyed by dotted setting name (`texplorer.logLevel`).
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Option<serde_json::Value>;
}

/// Read access to the project's files, relative to a working directory.
#[async_trait]
pub trait FileHandler: Send + Sync {
    fn cwd(&self) -> &Path;

    async fn exists(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> Result<String, ComponentError>;

    /// Absolute paths pass through, relative ones are joined onto `cwd`.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd().join(path)
        }
    }
}

/// Hands out free TCP ports, e.g. for debug listeners.
#[async_trait]
pub trait PortClient: Disposable {
    async fn acquire(&self) -> Result<u16, ComponentError>;

    fn release(&self, port: u16);
}

/// A port held from a [`PortClient`]; dropping it releases the port, so a
/// run abandoned mid-flight still gives its port back.
pub struct PortLease {
    client: Arc<dyn PortClient>,
    port: u16,
}

impl PortLease {
    pub async fn acquire(client: &Arc<dyn PortClient>) -> Result<Self, ComponentError> {
        let port = client.acquire().await?;
        Ok(Self {
            client: Arc::clone(client),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.client.release(self.port);
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

/// Shared across projects; each project gets its own client.
pub trait PortManager: Send + Sync {
    fn client(&self, namespace: &str) -> Arc<dyn PortClient>;
}

/// Where a debugger should attach.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugTarget {
    pub host: String,
    pub port: u16,
    pub cwd: PathBuf,
    pub tests: Vec<TestId>,
}

#[async_trait]
pub trait Debugger: Disposable {
    /// Namespace the debugger was created for.
    fn namespace(&self) -> &str;

    async fn attach(&self, target: &DebugTarget) -> Result<(), ComponentError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Status bar / notification surface of the host.
pub trait StatusSink: Send + Sync {
    fn status(&self, project: &str, text: &str);

    fn notify(&self, level: NoticeLevel, message: &str);

    /// Bring the named log channel to the foreground.
    fn reveal_log(&self, channel: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCwd(PathBuf);

    #[async_trait]
    impl FileHandler for FixedCwd {
        fn cwd(&self) -> &Path {
            &self.0
        }
        async fn exists(&self, _path: &Path) -> bool {
            false
        }
        async fn read(&self, path: &Path) -> Result<String, ComponentError> {
            Err(ComponentError::Io(format!("not found: {}", path.display())))
        }
    }

    #[test]
    fn resolve_joins_relative_paths() {
        let fh = FixedCwd(PathBuf::from("/work/project"));
        assert_eq!(
            fh.resolve(Path::new("tests.json")),
            PathBuf::from("/work/project/tests.json")
        );
        assert_eq!(fh.resolve(Path::new("/abs/x")), PathBuf::from("/abs/x"));
    }

    struct CountingPorts {
        released: parking_lot::Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl PortClient for CountingPorts {
        async fn acquire(&self) -> Result<u16, ComponentError> {
            Ok(9229)
        }
        fn release(&self, port: u16) {
            self.released.lock().push(port);
        }
    }

    #[async_trait]
    impl Disposable for CountingPorts {
        fn name(&self) -> &str {
            "ports"
        }
        async fn dispose(&self) -> Result<(), crate::errors::DisposeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lease_releases_on_drop() {
        let ports = Arc::new(CountingPorts {
            released: parking_lot::Mutex::new(Vec::new()),
        });
        let client: Arc<dyn PortClient> = ports.clone();
        let lease = PortLease::acquire(&client).await.unwrap();
        assert_eq!(lease.port(), 9229);
        assert!(ports.released.lock().is_empty());

        drop(lease);
        assert_eq!(*ports.released.lock(), vec![9229]);
    }

    #[test]
    fn debug_target_serde() {
        let target = DebugTarget {
            host: "127.0.0.1".into(),
            port: 9229,
            cwd: PathBuf::from("/w"),
            tests: vec![TestId::from("a")],
        };
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["port"], 9229);
        assert_eq!(json["tests"][0], "a");
    }
}
