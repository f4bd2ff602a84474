// crates/observability/src/lib.rs
//! Process-wide tracing setup shared by the jobcast binaries.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVES: &str = "warn,jobcast=info";

/// File name prefix for rotated log files.
const LOG_FILE_PREFIX: &str = "jobcast.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directives applied when `RUST_LOG` is not set.
    pub default_directives: String,
    /// JSON lines instead of the compact human format.
    pub json: bool,
    /// Also write daily-rotated files into this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_directives: DEFAULT_DIRECTIVES.to_string(),
            json: false,
            log_dir: None,
        }
    }
}

/// Build the filter from `RUST_LOG`, falling back to `default_directives`.
pub fn env_filter(default_directives: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directives)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{default_directives}': {e}"))
}

fn fmt_layer<W>(writer: W, json: bool, ansi: bool, filter: EnvFilter) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .with_filter(filter)
            .boxed()
    }
}

/// Install the global subscriber.
///
/// Console output goes to stderr. When `log_dir` is set, a second layer
/// writes through a non-blocking appender; the returned guard must be held
/// for the life of the process or buffered lines are lost.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(
        std::io::stderr,
        config.json,
        true,
        env_filter(&config.default_directives)?,
    )];

    let guard = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(fmt_layer(
                writer,
                config.json,
                false,
                env_filter(&config.default_directives)?,
            ));
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).try_init()?;
    Ok(guard)
}
