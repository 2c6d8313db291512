//! Logging bootstrap
//!
//! The runtime emits `tracing` events (spawn, park, steal, shutdown at
//! `debug`/`trace`, task panics at `warn`). Binaries call [`init`] once to
//! print them; `RUST_LOG` overrides the level passed in.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Scheduler internals (park, steal, wake)
    Trace,
    /// Task lifecycle
    Debug,
    /// Runtime lifecycle
    Info,
    /// Task panics
    Warn,
    /// Invariant violations
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Initialize logging at INFO
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logging at `level` unless `RUST_LOG` is set.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_with_level(level: LogLevel) {
    let default = tracing::Level::from(level).to_string().to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    let _ = Registry::default().with(layer).try_init();
}
