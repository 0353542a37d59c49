use serde::{Deserialize, Serialize};

use crate::ids::{GenerationId, RunId, TestId};
use crate::tree::TestNode;

/// Test metadata reload lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoadEvent {
    #[serde(rename = "load_started")]
    Started { generation: GenerationId },

    /// Exactly one of `suite` / `error` is set.
    #[serde(rename = "load_finished")]
    Finished {
        generation: GenerationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suite: Option<TestNode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl LoadEvent {
    pub fn generation(&self) -> &GenerationId {
        match self {
            Self::Started { generation } | Self::Finished { generation, .. } => generation,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "load_started",
            Self::Finished { .. } => "load_finished",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Finished { error: Some(_), .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Run,
    Debug,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteState {
    Running,
    Completed,
    Errored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    Running,
    Passed,
    Failed,
    Skipped,
    Errored,
}

/// Test run lifecycle and per-test results.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run_started")]
    Started {
        generation: GenerationId,
        run_id: RunId,
        tests: Vec<TestId>,
        mode: RunMode,
    },

    #[serde(rename = "suite")]
    Suite {
        run_id: RunId,
        suite: TestId,
        state: SuiteState,
    },

    #[serde(rename = "test")]
    Test {
        run_id: RunId,
        test: TestId,
        state: TestState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    #[serde(rename = "run_finished")]
    Finished {
        generation: GenerationId,
        run_id: RunId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::Started { run_id, .. }
            | Self::Suite { run_id, .. }
            | Self::Test { run_id, .. }
            | Self::Finished { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "run_started",
            Self::Suite { .. } => "suite",
            Self::Test { .. } => "test",
            Self::Finished { .. } => "run_finished",
        }
    }
}

/// Previously reported results that should now be considered stale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetireEvent {
    /// `None` retires every result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Vec<TestId>>,
}

impl RetireEvent {
    pub fn all() -> Self {
        Self { tests: None }
    }

    pub fn tests(tests: Vec<TestId>) -> Self {
        Self { tests: Some(tests) }
    }

    pub fn covers(&self, id: &TestId) -> bool {
        match &self.tests {
            None => true,
            Some(tests) => tests.contains(id),
        }
    }
}
