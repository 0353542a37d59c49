use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use texplorer_core::events::{RunEvent, TestState};
use texplorer_core::ids::TestId;
use texplorer_engine::DefaultComponentFactory;
use texplorer_server::{
    CommandRegistry, LocalPortManager, Orchestrator, ProjectContext, ProjectRegistry,
    ServerConfig, TracingStatusSink,
};
use texplorer_settings::{load_store_from_path, settings_path};
use texplorer_telemetry::{init_telemetry, SqliteLogSink, TelemetryConfig};

#[derive(Parser)]
#[command(name = "texplorer")]
#[command(about = "Test explorer host: discover, run and debug a project's tests", long_about = None)]
struct Cli {
    #[arg(long, global = true, help = "Settings file (defaults to ~/.texplorer/settings.json)")]
    settings: Option<PathBuf>,

    #[arg(long, global = true, help = "Human-readable logs instead of JSON lines")]
    text_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Serve one or more workspaces over JSON-RPC/WebSocket")]
    Serve {
        #[arg(short, long = "workspace", default_value = ".", help = "Workspace root (repeatable)")]
        workspaces: Vec<PathBuf>,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 9191)]
        port: u16,
    },

    #[command(about = "Load a workspace, run tests once and print run events")]
    Run {
        #[arg(short, long, default_value = ".", help = "Workspace root")]
        workspace: PathBuf,

        #[arg(help = "Test or suite ids; all discovered tests when omitted")]
        tests: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..Default::default()
    });
    let log_sink = telemetry.logs().cloned();

    let settings_file = cli.settings.clone().unwrap_or_else(settings_path);
    let config = Arc::new(
        load_store_from_path(&settings_file)
            .with_context(|| format!("loading settings from {}", settings_file.display()))?,
    );

    match cli.command {
        Command::Serve {
            workspaces,
            host,
            port,
        } => serve(workspaces, host, port, config, log_sink).await,
        Command::Run { workspace, tests } => run_once(workspace, tests, config, log_sink).await,
    }
}

fn project_name(workspace: &Path) -> String {
    workspace
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("workspace")
        .to_string()
}

async fn open_project(
    workspace: PathBuf,
    config: Arc<texplorer_settings::SettingsStore>,
    commands: Arc<CommandRegistry>,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<Arc<Orchestrator>> {
    let workspace = std::fs::canonicalize(&workspace)
        .with_context(|| format!("workspace {}", workspace.display()))?;
    let name = project_name(&workspace);
    let context = ProjectContext {
        namespace: format!("texplorer.{name}"),
        name,
        workspace,
        config,
        ports: Arc::new(LocalPortManager),
        status: Arc::new(TracingStatusSink),
    };

    let mut builder = Orchestrator::builder(context, Arc::new(DefaultComponentFactory)).commands(commands);
    if let Some(sink) = log_sink {
        builder = builder.log_sink(sink);
    }
    Ok(builder.build().await?)
}

async fn serve(
    workspaces: Vec<PathBuf>,
    host: String,
    port: u16,
    config: Arc<texplorer_settings::SettingsStore>,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<()> {
    let commands = Arc::new(CommandRegistry::new());
    let projects = Arc::new(ProjectRegistry::new());

    for workspace in workspaces {
        let orchestrator =
            open_project(workspace, Arc::clone(&config), Arc::clone(&commands), log_sink.clone()).await?;
        projects.insert(Arc::clone(&orchestrator))?;
        tokio::spawn(async move {
            if let Err(e) = orchestrator.load().await {
                tracing::warn!(project = orchestrator.namespace(), error = %e, "initial load failed");
            }
        });
    }

    let config = ServerConfig {
        host,
        port,
        ..Default::default()
    };
    let handle = texplorer_server::start(config, Arc::clone(&projects), commands).await?;
    tracing::info!(addr = %handle.addr, projects = projects.len(), "texplorer ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    drop(handle);
    projects.dispose_all().await;
    Ok(())
}

async fn run_once(
    workspace: PathBuf,
    tests: Vec<String>,
    config: Arc<texplorer_settings::SettingsStore>,
    log_sink: Option<Arc<SqliteLogSink>>,
) -> Result<()> {
    let orchestrator = open_project(workspace, config, Arc::new(CommandRegistry::new()), log_sink).await?;
    let outcome = run_and_print(&orchestrator, tests).await;
    orchestrator.dispose().await;
    outcome
}

async fn run_and_print(orchestrator: &Orchestrator, tests: Vec<String>) -> Result<()> {
    orchestrator.load().await?;
    let tests: Vec<TestId> = if tests.is_empty() {
        orchestrator
            .current_session()
            .suite()
            .map(|root| vec![root.id])
            .unwrap_or_default()
    } else {
        tests.into_iter().map(TestId::from).collect()
    };

    let mut events = orchestrator.run_events();
    let printer = tokio::spawn(async move {
        let mut failed = 0usize;
        while let Ok(event) = events.recv().await {
            println!("{}", serde_json::to_string(&event).unwrap_or_default());
            match event {
                RunEvent::Test {
                    state: TestState::Failed | TestState::Errored,
                    ..
                } => failed += 1,
                RunEvent::Finished { .. } => break,
                _ => {}
            }
        }
        failed
    });

    orchestrator.run(&tests).await?;
    let failed = printer.await.context("event printer")?;
    if failed > 0 {
        anyhow::bail!("{failed} test(s) failed");
    }
    Ok(())
}
