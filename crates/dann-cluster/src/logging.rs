//! Structured logging setup.
//!
//! The `DANN_LOG` environment variable selects the filter:
//!
//! - `DANN_LOG=info` - default level
//! - `DANN_LOG=dann_cluster::consistency=debug` - module-specific
//! - `DANN_LOG=warn,dann_index::kmeans=debug` - combined filters

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global subscriber at `info` unless `DANN_LOG` says
/// otherwise. Call once at startup; later calls are ignored.
pub fn init() {
    init_with_default("info");
}

/// Initializes the global subscriber with a custom default level.
pub fn init_with_default(default_level: &str) {
    let filter =
        EnvFilter::try_from_env("DANN_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        init_with_default("debug");
    }
}
