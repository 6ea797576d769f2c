//! Provide tracing, tailored to the pool daemon.
//!
//! At startup, the daemon calls one of the init_* functions to install a
//! tracing subscriber. Under systemd events go to the journal, otherwise to
//! stdout with local timestamps.
//!
//! The rest of the program can include `use crate::tracing::prelude::*` for
//! convenient access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and
//! `error!()` macros.

use std::env;
use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Environment variable holding the filter directives.
pub const FILTER_ENV: &str = "RUST_LOG";

/// Initialize logging at the default INFO level.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
pub fn init_journald_or_stdout() {
    init_with_default(LevelFilter::INFO);
}

/// Initialize logging with an explicit default level.
///
/// `RUST_LOG` still takes precedence when set, so operators can raise
/// verbosity for a single module (`RUST_LOG=ghostpool::shares=debug`).
pub fn init_with_default(default_level: LevelFilter) {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(filter(default_level))
                    .with(layer)
                    .init();
            }
            Err(e) => {
                use_stdout(default_level);
                error!(error = %e, "Failed to initialize journald logging, using stdout.");
            }
        }
    } else {
        use_stdout(default_level);
    }
}

fn filter(default_level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy()
}

fn use_stdout(default_level: LevelFilter) {
    tracing_subscriber::registry()
        .with(filter(default_level))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Local time to the nearest second. The default timer is UTC with
// sub-second precision, which is noise in a pool log.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{stamp}")
    }
}
