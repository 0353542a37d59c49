//! RPC method handlers.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use texplorer_engine::ExplorerError;

use crate::client::{ClientId, ClientRegistry};
use crate::commands::CommandRegistry;
use crate::orchestrator::Orchestrator;
use crate::projects::ProjectRegistry;
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub projects: Arc<ProjectRegistry>,
    pub commands: Arc<CommandRegistry>,
    pub clients: Arc<ClientRegistry>,
    started_at: Instant,
}

impl HandlerState {
    pub fn new(
        projects: Arc<ProjectRegistry>,
        commands: Arc<CommandRegistry>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            projects,
            commands,
            clients,
            started_at: Instant::now(),
        }
    }
}

/// Dispatch an RPC method. `client` is the caller, when the request arrived
/// over a WebSocket.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client: Option<&ClientId>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    match method {
        "explorer.load" => explorer_load(state, params, id).await,
        "explorer.run" => explorer_run(state, params, id, false).await,
        "explorer.debug" => explorer_run(state, params, id, true).await,
        "explorer.cancel" | "explorer.reset" => explorer_cancel(state, params, id).await,
        "explorer.subscribe" => explorer_subscribe(state, client, params, id, true),
        "explorer.unsubscribe" => explorer_subscribe(state, client, params, id, false),
        "explorer.projects" => explorer_projects(state, id),

        "command.execute" => command_execute(state, params, id).await,
        "command.list" => RpcResponse::success(id, json!({ "commands": state.commands.list() })),

        "system.ping" | "health" => health(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

fn project(
    state: &HandlerState,
    params: &Value,
    id: &Option<Value>,
) -> Result<Arc<Orchestrator>, RpcResponse> {
    let namespace =
        rpc::require_str(params, "project").map_err(|e| RpcResponse::invalid_params(id.clone(), e))?;
    state
        .projects
        .get(namespace)
        .ok_or_else(|| RpcResponse::project_not_found(id.clone(), namespace))
}

fn respond(id: Option<Value>, result: Result<Value, ExplorerError>) -> RpcResponse {
    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => RpcResponse::explorer_error(id, &e),
    }
}

async fn explorer_load(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let orchestrator = match project(state, params, &id) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let result = orchestrator.load().await.map(|()| {
        json!({
            "generation": orchestrator.generation(),
            "suite": orchestrator.current_session().suite(),
        })
    });
    respond(id, result)
}

async fn explorer_run(
    state: &HandlerState,
    params: &Value,
    id: Option<Value>,
    debug: bool,
) -> RpcResponse {
    let orchestrator = match project(state, params, &id) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let tests = match rpc::test_ids(params) {
        Ok(tests) => tests,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    let result = if debug {
        orchestrator.debug(&tests).await
    } else {
        orchestrator.run(&tests).await
    };
    respond(id, result.map(|run_id| json!({ "runId": run_id })))
}

async fn explorer_cancel(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let orchestrator = match project(state, params, &id) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let result = orchestrator.cancel().await.map(|()| {
        json!({
            "generation": orchestrator.generation(),
            "generationCount": orchestrator.generation_count(),
        })
    });
    respond(id, result)
}

fn explorer_subscribe(
    state: &HandlerState,
    client: Option<&ClientId>,
    params: &Value,
    id: Option<Value>,
    subscribe: bool,
) -> RpcResponse {
    let Some(client) = client else {
        return RpcResponse::error(id, rpc::INVALID_REQUEST, "Subscriptions need a WebSocket client");
    };
    let orchestrator = match project(state, params, &id) {
        Ok(o) => o,
        Err(resp) => return resp,
    };
    let changed = if subscribe {
        state.clients.subscribe(client, orchestrator.namespace())
    } else {
        state.clients.unsubscribe(client, orchestrator.namespace())
    };
    RpcResponse::success(
        id,
        json!({ "project": orchestrator.namespace(), "changed": changed }),
    )
}

fn explorer_projects(state: &HandlerState, id: Option<Value>) -> RpcResponse {
    let mut projects: Vec<Value> = state
        .projects
        .all()
        .iter()
        .map(|o| {
            json!({
                "namespace": o.namespace(),
                "name": o.name(),
                "generation": o.generation(),
                "generationCount": o.generation_count(),
            })
        })
        .collect();
    projects.sort_by(|a, b| a["namespace"].as_str().cmp(&b["namespace"].as_str()));
    RpcResponse::success(id, json!({ "projects": projects }))
}

async fn command_execute(state: &HandlerState, params: &Value, id: Option<Value>) -> RpcResponse {
    let command = match rpc::require_str(params, "command") {
        Ok(c) => c,
        Err(e) => return RpcResponse::invalid_params(id, e),
    };
    if !state.commands.contains(command) {
        return RpcResponse::method_not_found(id, command);
    }
    let args = params.get("args").cloned().unwrap_or(Value::Null);
    respond(id, state.commands.execute(command, args).await)
}

fn health(state: &HandlerState, id: Option<Value>) -> RpcResponse {
    let projects = state.projects.all();
    let live = projects.iter().filter(|o| !o.is_disposed()).count();
    RpcResponse::success(
        id,
        json!({
            "status": "healthy",
            "uptimeSecs": state.started_at.elapsed().as_secs(),
            "projects": live,
            "clients": state.clients.count(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::host::LocalPortManager;
    use crate::orchestrator::ProjectContext;
    use texplorer_engine::mock::{MockFactory, MockStatusSink};
    use texplorer_settings::SettingsStore;

    async fn setup() -> (Arc<HandlerState>, MockFactory) {
        let commands = Arc::new(CommandRegistry::new());
        let projects = Arc::new(ProjectRegistry::new());
        let factory = MockFactory::default();
        let orchestrator = Orchestrator::builder(
            ProjectContext {
                workspace: PathBuf::from("/work"),
                name: "demo".into(),
                namespace: "texplorer.demo".into(),
                config: Arc::new(SettingsStore::new()),
                ports: Arc::new(LocalPortManager),
                status: Arc::new(MockStatusSink::default()),
            },
            Arc::new(factory.clone()),
        )
        .commands(Arc::clone(&commands))
        .build()
        .await
        .unwrap();
        projects.insert(orchestrator).unwrap();
        let state = HandlerState::new(projects, commands, Arc::new(ClientRegistry::new(32)));
        (Arc::new(state), factory)
    }

    #[tokio::test]
    async fn health_reports_projects() {
        let (state, _) = setup().await;
        let resp = dispatch(&state, None, "system.ping", &json!({}), Some(json!(1))).await;
        assert!(resp.success);
        let result = resp.result.unwrap();
        assert_eq!(result["status"], "healthy");
        assert_eq!(result["projects"], 1);
    }

    #[tokio::test]
    async fn load_then_run() {
        let (state, factory) = setup().await;
        let params = json!({ "project": "texplorer.demo" });
        let resp = dispatch(&state, None, "explorer.load", &params, Some(json!(1))).await;
        assert!(resp.success, "{:?}", resp.error);
        assert_eq!(resp.result.unwrap()["suite"]["id"], "root");

        let params = json!({ "project": "texplorer.demo", "tests": ["math::add"] });
        let resp = dispatch(&state, None, "explorer.run", &params, Some(json!(2))).await;
        assert!(resp.success);
        assert!(resp.result.unwrap()["runId"].as_str().unwrap().starts_with("run_"));
        assert_eq!(factory.probe().runs().len(), 1);
        state.projects.dispose_all().await;
    }

    #[tokio::test]
    async fn malformed_ids_map_to_explorer_error() {
        let (state, _) = setup().await;
        let params = json!({ "project": "texplorer.demo", "tests": [" bad"] });
        let resp = dispatch(&state, None, "explorer.run", &params, None).await;
        assert_eq!(resp.error.unwrap().code, "MALFORMED_TEST_ID");
    }

    #[tokio::test]
    async fn unknown_project_and_method() {
        let (state, _) = setup().await;
        let resp = dispatch(&state, None, "explorer.load", &json!({ "project": "x" }), None).await;
        assert_eq!(resp.error.unwrap().code, "PROJECT_NOT_FOUND");

        let resp = dispatch(&state, None, "explorer.load", &json!({}), None).await;
        assert_eq!(resp.error.unwrap().code, "INVALID_PARAMS");

        let resp = dispatch(&state, None, "nope.nothing", &json!({}), None).await;
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn reset_command_builds_a_new_generation() {
        let (state, factory) = setup().await;
        let resp = dispatch(&state, None, "command.list", &json!({}), None).await;
        assert_eq!(
            resp.result.unwrap()["commands"],
            json!(["texplorer.demo.reset", "texplorer.demo.show-log"])
        );

        let params = json!({ "command": "texplorer.demo.reset" });
        let resp = dispatch(&state, None, "command.execute", &params, None).await;
        assert!(resp.success);
        assert_eq!(factory.probe().builds(), 2);

        let params = json!({ "command": "texplorer.demo.missing" });
        let resp = dispatch(&state, None, "command.execute", &params, None).await;
        assert_eq!(resp.error.unwrap().code, "METHOD_NOT_FOUND");
    }

    #[tokio::test]
    async fn subscribe_needs_a_client() {
        let (state, _) = setup().await;
        let params = json!({ "project": "texplorer.demo" });
        let resp = dispatch(&state, None, "explorer.subscribe", &params, None).await;
        assert_eq!(resp.error.unwrap().code, "INVALID_REQUEST");

        let (client, _rx) = state.clients.register();
        let resp = dispatch(&state, Some(&client), "explorer.subscribe", &params, None).await;
        assert_eq!(resp.result.unwrap()["changed"], true);
        assert_eq!(state.clients.clients_for_project("texplorer.demo"), vec![client]);
    }

    #[tokio::test]
    async fn disposed_project_reports_disposed() {
        let (state, _) = setup().await;
        let orchestrator = state.projects.get("texplorer.demo").unwrap();
        orchestrator.dispose().await;
        let resp = dispatch(&state, None, "explorer.load", &json!({ "project": "texplorer.demo" }), None).await;
        assert_eq!(resp.error.unwrap().code, "DISPOSED");
    }
}
