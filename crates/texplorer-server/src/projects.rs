use std::sync::Arc;

use dashmap::DashMap;

use texplorer_engine::ExplorerError;

use crate::orchestrator::Orchestrator;

/// Live orchestrators keyed by project namespace.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: DashMap<String, Arc<Orchestrator>>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, orchestrator: Arc<Orchestrator>) -> Result<(), ExplorerError> {
        let namespace = orchestrator.namespace().to_string();
        match self.projects.entry(namespace) {
            dashmap::mapref::entry::Entry::Occupied(e) => Err(ExplorerError::Internal(format!(
                "project already hosted: {}",
                e.key()
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(orchestrator);
                Ok(())
            }
        }
    }

    pub fn get(&self, namespace: &str) -> Option<Arc<Orchestrator>> {
        self.projects.get(namespace).map(|e| Arc::clone(e.value()))
    }

    /// Take a project out of the registry and dispose it.
    pub async fn remove(&self, namespace: &str) -> bool {
        match self.projects.remove(namespace) {
            Some((_, orchestrator)) => {
                orchestrator.dispose().await;
                true
            }
            None => false,
        }
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut out: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    pub fn all(&self) -> Vec<Arc<Orchestrator>> {
        self.projects.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Dispose every project, in no particular order.
    pub async fn dispose_all(&self) -> usize {
        let namespaces: Vec<String> = self.projects.iter().map(|e| e.key().clone()).collect();
        let mut disposed = 0;
        for namespace in namespaces {
            if self.remove(&namespace).await {
                disposed += 1;
            }
        }
        tracing::info!(disposed, "all projects disposed");
        disposed
    }
}
