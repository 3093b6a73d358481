use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "casestudy.logs.jsonl";

pub(crate) fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    std::env::var("CASESTUDY_OBSERVABILITY_ENABLED")
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(true)
}

fn resolve_env_filter() -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("CASESTUDY_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Installs the global tracing subscriber once per process.
///
/// Environment variables:
/// - `CASESTUDY_OBSERVABILITY_ENABLED`: set to `0`/`false`/`off` to skip installing a subscriber.
/// - `CASESTUDY_LOG_LEVEL`: level or filter directive (`info`, `casestudy_stream=debug`).
/// - `CASESTUDY_JSON_LOG_PATH`: write JSON lines to this file instead of compact
///   console output. Console output goes to stderr so it never mixes with
///   streamed document text on stdout.
/// - `RUST_LOG`: fallback filter when `CASESTUDY_LOG_LEVEL` is unset.
///
/// Libraries embedding the session should leave this to the application.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let env_filter = resolve_env_filter();
        match std::env::var("CASESTUDY_JSON_LOG_PATH") {
            Ok(path_raw) if !path_raw.trim().is_empty() => {
                let path = std::path::PathBuf::from(path_raw);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    let _ = std::fs::create_dir_all(parent);
                }
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| std::path::Path::new("."));
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_LOG_FILE);
                let writer = tracing_appender::rolling::never(dir, file_name);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(json_layer)
                    .try_init();
            }
            _ => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}
