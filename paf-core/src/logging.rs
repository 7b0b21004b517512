//! Structured logging setup (SPEC_FULL §10.1), grounded in the teacher's
//! `logging.rs`: JSON-formatted events, flattened fields, `EnvFilter` driven
//! by `RUST_LOG` (default `info`), with optional daily-rolling file output
//! via `tracing-appender` when `PAF_LOG_DIR` is set (the teacher's
//! equivalent is `SNAKEWAY_LOG_DIR`). The teacher's `TOKIO_CONSOLE`/
//! `console-subscriber` branch isn't carried — that crate isn't part of
//! this workspace's dependency stack.

use tracing_appender::rolling;
use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber. Call once, at process start.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Ok(dir) = std::env::var("PAF_LOG_DIR") {
        let appender = rolling::daily(dir, "paf.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);

        fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .with_writer(writer)
            .init();

        // The non-blocking writer's flush guard must outlive the process;
        // `main` never exits a healthy process, so leaking it is intentional.
        std::mem::forget(guard);
    } else {
        fmt()
            .with_env_filter(filter)
            .json()
            .flatten_event(true)
            .init();
    }
}
