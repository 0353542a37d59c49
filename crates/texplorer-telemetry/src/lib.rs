mod logger;
mod logging;

pub use logger::ProjectLogger;
pub use logging::{LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default stdout log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "texplorer_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit stdout logs as JSON lines instead of human-readable text.
    pub json: bool,
    /// Whether to persist logs to SQLite (backs the `show-log` command).
    pub log_to_sqlite: bool,
    /// Minimum level persisted to SQLite.
    pub persist_level: Level,
    /// Path to the log database.
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            log_to_sqlite: true,
            persist_level: Level::INFO,
            log_db_path: dirs_fallback().join("logs.db"),
        }
    }
}

/// Keeps the persisted log sink reachable after initialization.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
}

impl TelemetryGuard {
    /// Access the log sink for querying persisted logs.
    pub fn logs(&self) -> Option<&Arc<SqliteLogSink>> {
        self.log_sink.as_ref()
    }
}

/// Build the `EnvFilter` directive string from a config.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut filter_str = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

/// Initialize the telemetry subsystem. Call once at startup; later calls keep
/// the first subscriber.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter_str = filter_directives(&config);
    let env_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str))
    };

    let (json_layer, text_layer) = if config.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter());
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter());
        (None, Some(layer))
    };

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                let layer = SqliteLogLayer::new(Arc::clone(&sink), config.persist_level);
                (Some(layer), Some(sink))
            }
            Err(e) => {
                eprintln!("texplorer-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    if tracing_subscriber::registry()
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init()
        .is_err()
    {
        eprintln!("texplorer-telemetry: global subscriber already set");
    }

    TelemetryGuard {
        log_sink: sqlite_sink,
    }
}

/// Fallback home dir for default paths.
fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".texplorer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("texplorer_engine".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(filter_directives(&config), "warn,texplorer_engine=debug");
    }

    #[test]
    fn default_db_lives_under_dot_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.ends_with(".texplorer/logs.db"));
        assert!(config.log_to_sqlite);
    }
}
