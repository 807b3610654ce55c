use env_logger::{Builder, Env};

use crate::config::Tuning;

const FALLBACK_LEVEL: &str = "info";

/// `RUST_LOG` wins; otherwise `[logging] level` from the tuning file.
///
/// A broken tuning file is reported later by whoever actually needs it.
pub fn init() {
    let level = Tuning::load()
        .map(|t| t.logging.level)
        .unwrap_or_else(|_| FALLBACK_LEVEL.to_string());
    Builder::from_env(Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}
