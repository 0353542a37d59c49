use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;

use texplorer_core::dispose::Disposable;
use texplorer_core::errors::DisposeError;
use texplorer_core::events::TestState;
use texplorer_core::ids::TestId;
use texplorer_core::tree::TestNode;

use super::TestStore;

#[derive(Default)]
struct StoreState {
    root: Option<TestNode>,
    by_file: HashMap<PathBuf, Vec<TestId>>,
    results: HashMap<TestId, TestState>,
}

/// In-memory [`TestStore`]. Relative file paths in the tree resolve against `base`.
pub struct MemoryTestStore {
    base: PathBuf,
    state: RwLock<StoreState>,
}

impl MemoryTestStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            state: RwLock::new(StoreState::default()),
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        }
    }

    pub fn result_count(&self) -> usize {
        self.state.read().results.len()
    }
}

impl TestStore for MemoryTestStore {
    fn replace(&self, root: TestNode) {
        let mut by_file: HashMap<PathBuf, Vec<TestId>> = HashMap::new();
        for (file, id) in root.files_with_tests() {
            by_file.entry(self.absolute(&file)).or_default().push(id);
        }

        let mut state = self.state.write();
        // Drop results for tests that no longer exist
        state.results.retain(|id, _| root.find(id).is_some());
        state.by_file = by_file;
        state.root = Some(root);
    }

    fn root(&self) -> Option<TestNode> {
        self.state.read().root.clone()
    }

    fn get(&self, id: &TestId) -> Option<TestNode> {
        self.state.read().root.as_ref()?.find(id).cloned()
    }

    fn tests_in_file(&self, path: &Path) -> Vec<TestId> {
        self.state
            .read()
            .by_file
            .get(&self.absolute(path))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&self, id: &TestId, state: TestState) {
        let _ = self.state.write().results.insert(id.clone(), state);
    }

    fn last_state(&self, id: &TestId) -> Option<TestState> {
        self.state.read().results.get(id).copied()
    }
}

#[async_trait]
impl Disposable for MemoryTestStore {
    fn name(&self) -> &str {
        "test-store"
    }

    async fn dispose(&self) -> Result<(), DisposeError> {
        *self.state.write() = StoreState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> TestNode {
        TestNode::suite(
            "root",
            "root",
            vec![
                TestNode::suite(
                    "math",
                    "math",
                    vec![TestNode::test("math::add", "add"), TestNode::test("math::sub", "sub")],
                )
                .with_file("src/math.rs"),
                TestNode::test("io::read", "read").with_file("/abs/io.rs"),
            ],
        )
    }

    #[test]
    fn maps_files_to_tests() {
        let store = MemoryTestStore::new("/work");
        store.replace(tree());

        let math = store.tests_in_file(Path::new("/work/src/math.rs"));
        assert_eq!(
            math,
            vec![
                TestId::new("math"),
                TestId::new("math::add"),
                TestId::new("math::sub")
            ]
        );
        assert_eq!(store.tests_in_file(Path::new("src/math.rs")), math);
        assert_eq!(
            store.tests_in_file(Path::new("/abs/io.rs")),
            vec![TestId::new("io::read")]
        );
        assert!(store.tests_in_file(Path::new("/work/README.md")).is_empty());
    }

    #[test]
    fn replace_prunes_stale_results() {
        let store = MemoryTestStore::new("/work");
        store.replace(tree());
        store.record(&TestId::new("math::add"), TestState::Passed);
        store.record(&TestId::new("io::read"), TestState::Failed);

        store.replace(TestNode::suite("root", "root", vec![TestNode::test("math::add", "add")]));

        assert_eq!(store.last_state(&TestId::new("math::add")), Some(TestState::Passed));
        assert_eq!(store.last_state(&TestId::new("io::read")), None);
        assert_eq!(store.result_count(), 1);
    }

    #[tokio::test]
    async fn dispose_clears_everything() {
        let store = MemoryTestStore::new("/work");
        store.replace(tree());
        store.record(&TestId::new("math::add"), TestState::Passed);

        store.dispose().await.unwrap();

        assert!(store.root().is_none());
        assert!(store.get(&TestId::new("math")).is_none());
        assert_eq!(store.result_count(), 0);
    }
}
