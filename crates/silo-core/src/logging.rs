use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Filtering comes from `RUST_LOG`
/// when set, `info` otherwise. Safe to call more than once; only the first
/// call installs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
