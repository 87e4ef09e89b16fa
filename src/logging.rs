//! Logging setup for binaries built on the crate.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the caller. [`init_logging`] is what the bundled CLI uses.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor an explicit level is given.
pub const DEFAULT_FILTER: &str = "info";

/// Install a console subscriber.
///
/// `level` is an `EnvFilter` directive such as `"debug"` or
/// `"info,geotiler::hierarchy=debug"`. `RUST_LOG` overrides it. Calling this
/// twice is harmless; the second call leaves the first subscriber in place.
pub fn init_logging(level: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .try_init();
}

/// Filter for an optional level directive, falling back to [`DEFAULT_FILTER`]
/// when it does not parse.
pub fn filter_for(level: Option<&str>) -> EnvFilter {
    level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
