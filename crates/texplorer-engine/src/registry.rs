use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use texplorer_core::dispose::Disposable;
use tracing::warn;

/// Outcome of a [`DisposalRegistry::dispose_all`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisposalReport {
    pub released: usize,
    pub failed: usize,
}

impl DisposalReport {
    pub fn total(&self) -> usize {
        self.released + self.failed
    }
}

/// Ordered set of resources released last-registered-first.
///
/// Every entry is released at most once: `dispose_all` drains the registry
/// before releasing, so a second pass finds nothing. Entries registered after
/// a pass belong to the next one.
pub struct DisposalRegistry {
    label: String,
    entries: Mutex<Vec<Arc<dyn Disposable>>>,
}

impl DisposalRegistry {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Append a resource. Registering the same handle twice is ignored.
    pub fn register(&self, disposable: Arc<dyn Disposable>) {
        let mut entries = self.entries.lock();
        let ptr = Arc::as_ptr(&disposable) as *const ();
        if entries.iter().any(|e| Arc::as_ptr(e) as *const () == ptr) {
            return;
        }
        entries.push(disposable);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.name().to_string()).collect()
    }

    /// Release every entry in reverse registration order.
    ///
    /// A failing or panicking release is logged and counted; the remaining
    /// entries are still released.
    pub async fn dispose_all(&self) -> DisposalReport {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut report = DisposalReport::default();

        for entry in entries.into_iter().rev() {
            match AssertUnwindSafe(entry.dispose()).catch_unwind().await {
                Ok(Ok(())) => report.released += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        registry = %self.label,
                        resource = entry.name(),
                        error = %e,
                        "disposal failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(
                        registry = %self.label,
                        resource = entry.name(),
                        "disposal panicked"
                    );
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for DisposalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisposalRegistry")
            .field("label", &self.label)
            .field("entries", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use texplorer_core::dispose::DisposeFn;
    use texplorer_core::errors::DisposeError;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(name: &str, log: &Log) -> Arc<dyn Disposable> {
        let log = Arc::clone(log);
        let n = name.to_string();
        DisposeFn::infallible(name, move || log.lock().push(n)).into_arc()
    }

    fn failing(name: &str, log: &Log) -> Arc<dyn Disposable> {
        let log = Arc::clone(log);
        let n = name.to_string();
        DisposeFn::new(name, move || {
            log.lock().push(n.clone());
            Err(DisposeError::new(n, "boom"))
        })
        .into_arc()
    }

    struct Panicking;

    #[async_trait]
    impl Disposable for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }
        async fn dispose(&self) -> Result<(), DisposeError> {
            panic!("release exploded");
        }
    }

    #[tokio::test]
    async fn releases_in_reverse_order() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("test");
        registry.register(recording("r1", &log));
        registry.register(recording("r2", &log));
        registry.register(recording("r3", &log));

        let report = registry.dispose_all().await;

        assert_eq!(*log.lock(), vec!["r3", "r2", "r1"]);
        assert_eq!(report, DisposalReport { released: 3, failed: 0 });
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("test");
        registry.register(recording("r1", &log));

        registry.dispose_all().await;
        let second = registry.dispose_all().await;

        assert_eq!(log.lock().len(), 1);
        assert_eq!(second.total(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failure_does_not_block_the_rest() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("test");
        registry.register(recording("r1", &log));
        registry.register(failing("r2", &log));
        registry.register(recording("r3", &log));

        let report = registry.dispose_all().await;

        assert_eq!(*log.lock(), vec!["r3", "r2", "r1"]);
        assert_eq!(report, DisposalReport { released: 2, failed: 1 });
    }

    #[tokio::test]
    async fn panic_does_not_block_the_rest() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("test");
        registry.register(recording("r1", &log));
        registry.register(Arc::new(Panicking));
        registry.register(recording("r3", &log));

        let report = registry.dispose_all().await;

        assert_eq!(*log.lock(), vec!["r3", "r1"]);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_released_once() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("test");
        let r1 = recording("r1", &log);
        registry.register(Arc::clone(&r1));
        registry.register(r1);
        assert_eq!(registry.len(), 1);

        registry.dispose_all().await;
        assert_eq!(*log.lock(), vec!["r1"]);
    }

    #[tokio::test]
    async fn reusable_after_dispose() {
        let log: Log = Arc::default();
        let registry = DisposalRegistry::new("session");
        registry.register(recording("gen1", &log));
        registry.dispose_all().await;

        registry.register(recording("gen2", &log));
        assert_eq!(registry.names(), vec!["gen2"]);
        registry.dispose_all().await;

        assert_eq!(*log.lock(), vec!["gen1", "gen2"]);
    }
}
