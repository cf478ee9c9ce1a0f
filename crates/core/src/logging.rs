//! Structured logging infrastructure for Rollcall.
//!
//! Output is human-readable or JSON depending on `[logging].json`. The
//! `RUST_LOG` environment variable overrides the configured level.
//!
//! # Example
//! ```no_run
//! use rollcall_core::{logging, Config};
//!
//! let config = Config::default_config();
//! logging::init_from_config(&config.logging);
//! tracing::info!(service = "rollcall-node", "Service started");
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Directives from `RUST_LOG` when set and parseable, else `default_level`.
fn build_filter(env_directives: Option<&str>, default_level: &str) -> EnvFilter {
    env_directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

/// Initialize logging from the `[logging]` config section.
///
/// Returns quietly if a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let registry = tracing_subscriber::registry().with(build_filter(env.as_deref(), &config.level));

    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
