//! Host-visible commands, registered per project under its namespace.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;

use texplorer_core::dispose::{Disposable, DisposeFn};
use texplorer_engine::ExplorerError;

pub type CommandHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ExplorerError>> + Send + Sync>;

/// Command table shared by every project on a host.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: Arc<DashMap<String, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`. Disposing the returned handle removes it.
    pub fn register(
        &self,
        id: impl Into<String>,
        handler: CommandHandler,
    ) -> Result<Arc<dyn Disposable>, ExplorerError> {
        let id = id.into();
        match self.handlers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ExplorerError::Internal(format!(
                    "command already registered: {id}"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        tracing::debug!(command = %id, "command registered");

        let handlers = Arc::clone(&self.handlers);
        let name = format!("command:{id}");
        Ok(DisposeFn::infallible(name, move || {
            handlers.remove(&id);
            tracing::debug!(command = %id, "command unregistered");
        })
        .into_arc())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.contains_key(id)
    }

    pub async fn execute(&self, id: &str, args: Value) -> Result<Value, ExplorerError> {
        // Clone out so no map guard is held across the await
        let handler = self
            .handlers
            .get(id)
            .map(|h| Arc::clone(h.value()))
            .ok_or_else(|| ExplorerError::Internal(format!("unknown command: {id}")))?;
        handler(args).await
    }

    /// Registered command ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn echo() -> CommandHandler {
        Arc::new(|args: Value| async move { Ok::<_, ExplorerError>(json!({ "echo": args })) }.boxed())
    }

    #[tokio::test]
    async fn execute_runs_handler() {
        let registry = CommandRegistry::new();
        let _handle = registry.register("demo.echo", echo()).unwrap();

        let out = registry.execute("demo.echo", json!(7)).await.unwrap();
        assert_eq!(out["echo"], 7);
    }

    #[tokio::test]
    async fn disposing_handle_unregisters() {
        let registry = CommandRegistry::new();
        let handle = registry.register("demo.echo", echo()).unwrap();
        assert_eq!(handle.name(), "command:demo.echo");
        assert!(registry.contains("demo.echo"));

        handle.dispose().await.unwrap();
        assert!(registry.is_empty());
        assert!(registry.execute("demo.echo", Value::Null).await.is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let registry = CommandRegistry::new();
        let _first = registry.register("demo.reset", echo()).unwrap();
        let err = registry.register("demo.reset", echo()).err().unwrap();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_is_sorted() {
        let registry = CommandRegistry::new();
        let _b = registry.register("b.reset", echo()).unwrap();
        let _a = registry.register("a.show-log", echo()).unwrap();
        assert_eq!(registry.list(), vec!["a.show-log", "b.reset"]);
    }
}
