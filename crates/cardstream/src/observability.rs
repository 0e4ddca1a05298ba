use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn observability_enabled() -> bool {
    for key in ["CARDSTREAM_OBSERVABILITY_ENABLED", "CARDSTREAM_OBSERVABILITY"] {
        if let Ok(value) = std::env::var(key) {
            return parse_bool_env(&value).unwrap_or(true);
        }
    }
    true
}

/// Where log records are written.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogSink {
    Console,
    JsonFile(std::path::PathBuf),
}

impl LogSink {
    fn from_env() -> Self {
        match std::env::var("CARDSTREAM_JSON_LOG_PATH") {
            Ok(path) if !path.trim().is_empty() => Self::JsonFile(path.into()),
            _ => Self::Console,
        }
    }

    /// Filter used when neither `CARDSTREAM_LOG_LEVEL` nor `RUST_LOG` is set.
    fn default_filter(&self) -> &'static str {
        match self {
            Self::Console => "warn",
            Self::JsonFile(_) => "warn,cardstream=info",
        }
    }
}

fn resolve_env_filter(sink: &LogSink) -> tracing_subscriber::EnvFilter {
    if let Ok(level) = std::env::var("CARDSTREAM_LOG_LEVEL")
        && let Ok(filter) = tracing_subscriber::EnvFilter::try_new(level)
    {
        return filter;
    }
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(sink.default_filter()))
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `CARDSTREAM_OBSERVABILITY_ENABLED` / `CARDSTREAM_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `CARDSTREAM_LOG_LEVEL`: optional level/filter override (`info`, `cardstream=debug`, ...).
/// - `CARDSTREAM_JSON_LOG_PATH`: optional log file path. If set, logs are JSONL in that file
///   and turn lifecycle records (`cardstream=info`) are kept by default.
///   If unset, warnings go to stderr in a compact console format so stdout stays free for output.
/// - `RUST_LOG`: optional filter override.
pub fn init_observability() {
    INIT.get_or_init(|| {
        if !observability_enabled() {
            return;
        }

        let sink = LogSink::from_env();
        let env_filter = resolve_env_filter(&sink);
        if let LogSink::JsonFile(path) = &sink {
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
                .unwrap_or("cardstream.logs.jsonl");
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
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_boolean_flags() {
        assert_eq!(parse_bool_env(" On "), Some(true));
        assert_eq!(parse_bool_env("disabled"), Some(false));
        assert_eq!(parse_bool_env("maybe"), None);
    }

    #[test]
    fn file_sink_keeps_turn_lifecycle_by_default() {
        assert_eq!(LogSink::Console.default_filter(), "warn");
        let sink = LogSink::JsonFile("logs/cardstream.jsonl".into());
        assert_eq!(sink.default_filter(), "warn,cardstream=info");
        assert!(tracing_subscriber::EnvFilter::try_new(sink.default_filter()).is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        init_observability();
        init_observability();
    }
}
