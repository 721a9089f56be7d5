//! Tracing setup shared by binaries and tests.
//!
//! Binaries call [`init_tracing`] once at startup and keep the returned [`LogFlusher`] alive
//! until exit. Tests call [`init_test_tracing`], which only installs a subscriber when
//! `ENABLE_TRACING` is set.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::io;
use std::panic::PanicHookInfo;
use std::sync::Once;

use ::tracing::Level;
use config::environment::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable naming a directory for log files. Logs go to stdout when unset.
const LOGS_DIR_ENV_NAME: &str = "LOGS_DIR";

/// Environment variable enabling log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

static INIT_TEST_TRACING: Once = Once::new();

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] io::Error),

    #[error("failed to bridge `log` records: {0}")]
    LogTracer(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the global subscriber: {0}")]
    SetGlobalDefault(#[from] ::tracing::subscriber::SetGlobalDefaultError),
}

/// Flushes buffered log lines when dropped.
#[must_use = "dropping the flusher stops the background log writer"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber for `app_name`.
///
/// Development builds log human readable lines, production logs flattened JSON. The level
/// defaults to `info` and can be overridden with `RUST_LOG`.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    let (writer, guard) = match std::env::var(LOGS_DIR_ENV_NAME) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{app_name}.log"));
            tracing_appender::non_blocking(appender)
        }
        Err(_) => tracing_appender::non_blocking(io::stdout()),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let layer = if environment.is_prod() {
        fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed()
    } else {
        fmt::layer().with_writer(writer).with_target(true).boxed()
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);

    LogTracer::init()?;
    ::tracing::subscriber::set_global_default(subscriber)?;
    std::panic::set_hook(Box::new(report_panic));

    ::tracing::info!(app_name, %environment, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

/// Installs a test-writer subscriber once per process when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
        return;
    }

    INIT_TEST_TRACING.call_once(|| {
        let filter = EnvFilter::builder()
            .with_default_directive(Level::INFO.into())
            .from_env_lossy();

        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Routes panics through `tracing` so they end up in the same sink as the logs.
fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let backtrace = Backtrace::capture();
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        });

    match (panic_info.location(), payload) {
        (Some(location), Some(payload)) if backtrace.status() != BacktraceStatus::Captured => {
            ::tracing::error!(
                "{}:{}:{}: {}",
                location.file(),
                location.line(),
                location.column(),
                payload
            );
        }
        _ => {
            ::tracing::error!("{}\n{}", panic_info, backtrace);
        }
    }
}
