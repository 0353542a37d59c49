//! Resets against the stock components: real child processes and real ports.
#![cfg(target_os = "linux")]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use texplorer_core::host::{PortClient, PortManager};
use texplorer_core::ids::TestId;
use texplorer_engine::mock::MockStatusSink;
use texplorer_engine::{DefaultComponentFactory, ExplorerError};
use texplorer_server::{LocalPortClient, Orchestrator, ProjectContext};
use texplorer_settings::SettingsStore;

struct SharedPorts(Arc<LocalPortClient>);

impl PortManager for SharedPorts {
    fn client(&self, _namespace: &str) -> Arc<dyn PortClient> {
        Arc::clone(&self.0) as Arc<dyn PortClient>
    }
}

/// A workspace with one test whose runner records its pid and then sleeps.
async fn sleeping_project(dir: &Path, ports: Arc<LocalPortClient>) -> Arc<Orchestrator> {
    std::fs::write(
        dir.join("tests.json"),
        r#"[{"id":"a","label":"a","kind":"test"}]"#,
    )
    .unwrap();

    let config = Arc::new(SettingsStore::new());
    config.set(
        "texplorer.runner",
        json!({ "command": "sh", "args": ["-c", "echo $$ > pid; exec sleep 30"] }),
    );
    config.set("texplorer.watch", json!({ "enabled": false }));

    Orchestrator::builder(
        ProjectContext {
            workspace: dir.to_path_buf(),
            name: "sleepy".into(),
            namespace: "texplorer.sleepy".into(),
            config,
            ports: Arc::new(SharedPorts(ports)),
            status: Arc::new(MockStatusSink::default()),
        },
        Arc::new(DefaultComponentFactory),
    )
    .build()
    .await
    .unwrap()
}

async fn runner_pid(dir: &Path) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(pid) = std::fs::read_to_string(dir.join("pid")) {
                if !pid.trim().is_empty() {
                    return pid.trim().to_string();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("runner never started")
}

fn is_alive(pid: &str) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[tokio::test]
async fn reset_kills_the_previous_generations_runner() {
    let dir = tempfile::tempdir().unwrap();
    let ports = Arc::new(LocalPortClient::new("texplorer.sleepy"));
    let orchestrator = sleeping_project(dir.path(), ports).await;
    orchestrator.load().await.unwrap();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(&[TestId::from("a")]).await })
    };
    let pid = runner_pid(dir.path()).await;
    assert!(is_alive(&pid));

    orchestrator.cancel().await.unwrap();

    assert!(!is_alive(&pid), "runner {pid} survived the reset");
    assert_eq!(orchestrator.generation_count(), 2);
    assert!(matches!(
        running.await.unwrap(),
        Err(ExplorerError::SessionSuperseded)
    ));
    orchestrator.dispose().await;
}

#[tokio::test]
async fn reset_returns_the_debug_port() {
    let dir = tempfile::tempdir().unwrap();
    let ports = Arc::new(LocalPortClient::new("texplorer.sleepy"));
    let orchestrator = sleeping_project(dir.path(), Arc::clone(&ports)).await;
    orchestrator.load().await.unwrap();

    let debugging = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.debug(&[TestId::from("a")]).await })
    };
    let pid = runner_pid(dir.path()).await;
    assert_eq!(ports.leased(), 1);

    orchestrator.cancel().await.unwrap();

    assert!(matches!(
        debugging.await.unwrap(),
        Err(ExplorerError::SessionSuperseded)
    ));
    assert_eq!(ports.leased(), 0);
    assert!(!is_alive(&pid));
    orchestrator.dispose().await;
}

#[tokio::test]
async fn dispose_kills_a_running_runner() {
    let dir = tempfile::tempdir().unwrap();
    let ports = Arc::new(LocalPortClient::new("texplorer.sleepy"));
    let orchestrator = sleeping_project(dir.path(), ports).await;

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(&[TestId::from("a")]).await })
    };
    let pid = runner_pid(dir.path()).await;

    orchestrator.dispose().await;

    assert!(!is_alive(&pid));
    assert!(running.await.unwrap().is_err());
}
