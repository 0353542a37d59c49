use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::DisposeError;

/// A resource with an explicit release operation.
///
/// Implementations should make `dispose` safe to call more than once; the
/// registries that own them only ever call it once.
#[async_trait]
pub trait Disposable: Send + Sync {
    /// Name used in logs when release fails.
    fn name(&self) -> &str;

    async fn dispose(&self) -> Result<(), DisposeError>;
}

type ReleaseFn = Box<dyn FnOnce() -> Result<(), DisposeError> + Send>;

/// Wraps a synchronous closure as a [`Disposable`]. The closure runs at most once.
pub struct DisposeFn {
    name: String,
    release: Mutex<Option<ReleaseFn>>,
}

impl DisposeFn {
    pub fn new<F>(name: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() -> Result<(), DisposeError> + Send + 'static,
    {
        Self {
            name: name.into(),
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    /// Infallible variant.
    pub fn infallible<F>(name: impl Into<String>, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(name, move || {
            release();
            Ok(())
        })
    }

    pub fn into_arc(self) -> Arc<dyn Disposable> {
        Arc::new(self)
    }

    pub fn is_released(&self) -> bool {
        self.release.lock().is_none()
    }
}

#[async_trait]
impl Disposable for DisposeFn {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        let release = self.release.lock().take();
        match release {
            Some(f) => f(),
            None => Ok(()),
        }
    }
}
