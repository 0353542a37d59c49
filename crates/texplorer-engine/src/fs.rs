use std::path::{Path, PathBuf};

use async_trait::async_trait;

use texplorer_core::errors::ComponentError;
use texplorer_core::host::FileHandler;

/// [`FileHandler`] over the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalFileHandler {
    cwd: PathBuf,
}

impl LocalFileHandler {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self { cwd: cwd.into() }
    }
}

#[async_trait]
impl FileHandler for LocalFileHandler {
    fn cwd(&self) -> &Path {
        &self.cwd
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<String, ComponentError> {
        let path = self.resolve(path);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ComponentError::Io(format!("{}: {e}", path.display())))
    }
}
