use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber: env-filterable, non-ANSI,
/// stderr-targeted.
pub fn init() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();
}
