//! Tracing setup for `patcherd`.
//!
//! Everything goes to stderr. The gateway subcommands print build ids on
//! stdout for the agent to read, so nothing else may write there.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events follow the requested level; everything else is
/// held at `warn`.
const PATCHER_TARGETS: &[&str] = &["patcher_core", "patcherd"];

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(
        PATCHER_TARGETS
            .iter()
            .map(|target| format!("{target}={}", level.as_str().to_lowercase())),
    );
    directives.join(",")
}

/// Install the global subscriber; later calls are no-ops.
///
/// `json` switches to one JSON object per line for the framework's log
/// collector. `RUST_LOG` overrides `level` when set.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = if json {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .try_init()
    };
    // A subscriber installed by a test harness or an embedding binary wins.
    installed.ok();
}
