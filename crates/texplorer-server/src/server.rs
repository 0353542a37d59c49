use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

use crate::client::{self, ClientId, ClientRegistry};
use crate::commands::CommandRegistry;
use crate::event_bridge;
use crate::handlers::{self, HandlerState};
use crate::projects::ProjectRegistry;
use crate::rpc::{RpcRequest, RpcResponse};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    /// Upper bound for plain HTTP requests; WebSocket sessions are exempt.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9191,
            max_send_queue: 256,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler).layer(TimeoutLayer::new(request_timeout)))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind, then serve every project in `projects` until the handle is dropped.
pub async fn start(
    config: ServerConfig,
    projects: Arc<ProjectRegistry>,
    commands: Arc<CommandRegistry>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridges = projects
        .all()
        .into_iter()
        .map(|o| {
            event_bridge::start(
                o.namespace().to_string(),
                Arc::clone(o.channels()),
                Arc::clone(&client_registry),
            )
        })
        .collect();

    let cleanup = client::start_cleanup_task(Arc::clone(&client_registry), Duration::from_secs(60));

    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let handler_state = Arc::new(HandlerState::new(
        projects,
        commands,
        Arc::clone(&client_registry),
    ));
    let rpc = tokio::spawn(process_rpc_messages(
        msg_rx,
        Arc::clone(&handler_state),
        Arc::clone(&client_registry),
    ));

    let router = build_router(
        AppState {
            handler_state,
            client_registry,
            message_tx: msg_tx,
        },
        Duration::from_secs(config.request_timeout_secs),
    );
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "texplorer server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        tasks: vec![server, rpc, cleanup],
        bridges,
    })
}

/// Keeps the server's background tasks alive; dropping it stops them.
pub struct ServerHandle {
    pub addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    bridges: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..).chain(self.bridges.drain(..)) {
            task.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "websocket client connected");
    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = handlers::dispatch(&state.handler_state, None, "health", &serde_json::json!({}), None).await;
    (axum::http::StatusCode::OK, axum::Json(resp.result.unwrap_or_default()))
}

/// Each request runs on its own task so a long run never blocks a reset.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        let request: RpcRequest = match serde_json::from_str(&raw) {
            Ok(req) => req,
            Err(_) => {
                if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                    registry.send_to(&client_id, json);
                }
                continue;
            }
        };

        let state = Arc::clone(&state);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let params = request.params.unwrap_or_else(|| serde_json::json!({}));
            let response =
                handlers::dispatch(&state, Some(&client_id), &request.method, &params, request.id).await;
            if let Ok(json) = serde_json::to_string(&response) {
                registry.send_to(&client_id, json);
            }
        });
    }
}
