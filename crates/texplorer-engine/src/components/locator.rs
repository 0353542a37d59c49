use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::{ComponentError, DisposeError};
use texplorer_core::host::FileHandler;
use texplorer_core::tree::TestNode;
use texplorer_telemetry::ProjectLogger;

use super::TestLocator;

pub const ROOT_ID: &str = "root";

/// Reads the test tree from a JSON manifest.
///
/// The manifest is either a single root node or an array of top-level nodes,
/// which get wrapped in a synthetic `root` suite.
pub struct ManifestLocator {
    files: Arc<dyn FileHandler>,
    manifest: PathBuf,
    root_label: String,
    disposed: AtomicBool,
    logger: ProjectLogger,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    Root(TestNode),
    Nodes(Vec<TestNode>),
}

impl ManifestLocator {
    pub fn new(
        files: Arc<dyn FileHandler>,
        manifest: PathBuf,
        root_label: impl Into<String>,
        logger: ProjectLogger,
    ) -> Self {
        Self {
            files,
            manifest,
            root_label: root_label.into(),
            disposed: AtomicBool::new(false),
            logger,
        }
    }

    pub fn manifest(&self) -> &PathBuf {
        &self.manifest
    }

    fn parse(&self, content: &str) -> Result<TestNode, ComponentError> {
        let root = match serde_json::from_str::<Manifest>(content)? {
            Manifest::Root(node) => node,
            Manifest::Nodes(nodes) => TestNode::suite(ROOT_ID, self.root_label.clone(), nodes),
        };
        validate(&root)?;
        Ok(root)
    }
}

fn validate(root: &TestNode) -> Result<(), ComponentError> {
    let mut seen = HashSet::new();
    for node in root.walk() {
        if !node.id.is_well_formed() {
            return Err(ComponentError::Manifest(format!(
                "malformed test id {:?}",
                node.id.as_str()
            )));
        }
        if !seen.insert(&node.id) {
            return Err(ComponentError::Manifest(format!(
                "duplicate test id {}",
                node.id
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl TestLocator for ManifestLocator {
    async fn locate(&self) -> Result<TestNode, ComponentError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ComponentError::Disposed("locator".into()));
        }
        if !self.files.exists(&self.manifest).await {
            return Err(ComponentError::Manifest(format!(
                "manifest not found: {}",
                self.manifest.display()
            )));
        }
        let content = self.files.read(&self.manifest).await?;
        let root = self.parse(&content)?;
        self.logger.debug(format_args!(
            "located {} tests in {}",
            root.leaves().len(),
            self.manifest.display()
        ));
        Ok(root)
    }

    fn sources(&self) -> Vec<PathBuf> {
        vec![self.manifest.clone()]
    }
}

#[async_trait]
impl Disposable for ManifestLocator {
    fn name(&self) -> &str {
        "locator"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
