//! Tracing bootstrap for hosts and test binaries that do not install their
//! own subscriber.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,taskchat_core=debug";

/// Install a global fmt subscriber. Safe to call more than once.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `TASKCHAT_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("TASKCHAT_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        if let Ok(filter) = EnvFilter::try_new(value) {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
