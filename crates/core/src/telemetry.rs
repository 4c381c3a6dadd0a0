use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Installs the global tracing subscriber. Safe to call more than once; only
/// the first call wins. Level selection follows RUST_LOG, defaulting to info.
pub fn setup_logging() {
	INITIALIZED.get_or_init(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
		tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer().with_target(true))
			.init();
	});
}

/// Test-friendly variant: never panics when a subscriber is already installed.
pub fn testing_logging() {
	INITIALIZED.get_or_init(|| {
		let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
		let _ = tracing_subscriber::registry()
			.with(filter)
			.with(tracing_subscriber::fmt::layer().with_test_writer())
			.try_init();
	});
}
