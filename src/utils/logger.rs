// src/utils/logger.rs

use env_logger::{Builder, Env};

/// Installs the global logger. Defaults to `info`, overridable with `RUST_LOG`.
/// Logs go to stderr so JSON results on stdout stay machine-readable.
pub fn init() {
	Builder::from_env(Env::default().default_filter_or("info"))
		.format_timestamp_millis()
		.format_module_path(true)
		.target(env_logger::Target::Stderr)
		.init();
}
