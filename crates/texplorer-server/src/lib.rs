//! Hosts test-explorer projects: one [`Orchestrator`] per project, the
//! commands they register, and a JSON-RPC surface over WebSocket.

pub mod client;
pub mod commands;
pub mod event_bridge;
pub mod handlers;
pub mod host;
pub mod orchestrator;
pub mod projects;
pub mod rpc;
pub mod server;

pub use commands::{CommandHandler, CommandRegistry};
pub use host::{LocalPortClient, LocalPortManager, NoticeDebugger, TracingStatusSink};
pub use orchestrator::{ConfigChange, Orchestrator, OrchestratorBuilder, ProjectContext};
pub use projects::ProjectRegistry;
pub use server::{start, ServerConfig, ServerHandle};
