use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::TestId;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Suite,
    Test,
}

/// A node of the discovered test hierarchy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestNode {
    pub id: TestId,
    pub label: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TestNode>,
}

impl TestNode {
    pub fn suite(id: impl Into<TestId>, label: impl Into<String>, children: Vec<TestNode>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: NodeKind::Suite,
            file: None,
            line: None,
            children,
        }
    }

    pub fn test(id: impl Into<TestId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: NodeKind::Test,
            file: None,
            line: None,
            children: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn is_suite(&self) -> bool {
        self.kind == NodeKind::Suite
    }

    /// Depth-first search by id.
    pub fn find(&self, id: &TestId) -> Option<&TestNode> {
        if &self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    /// Leaf tests beneath (or equal to) this node, in tree order.
    pub fn leaves(&self) -> Vec<&TestNode> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a TestNode>) {
        if self.kind == NodeKind::Test {
            out.push(self);
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }

    /// Every node in the tree, parents before children.
    pub fn walk(&self) -> Vec<&TestNode> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }

    /// Source file of this node, inherited from the nearest ancestor that has one.
    pub fn files_with_tests(&self) -> Vec<(PathBuf, TestId)> {
        let mut out = Vec::new();
        self.collect_files(None, &mut out);
        out
    }

    fn collect_files(&self, inherited: Option<&PathBuf>, out: &mut Vec<(PathBuf, TestId)>) {
        let file = self.file.as_ref().or(inherited);
        if let Some(f) = file {
            out.push((f.clone(), self.id.clone()));
        }
        for child in &self.children {
            child.collect_files(file, out);
        }
    }
}
