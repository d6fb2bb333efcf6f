/* Optional convenience for hosts that want the engine's `tracing` output on
 * stderr without wiring up their own subscriber. The foreign-call surface
 * never installs this itself, since a host process may already own a
 * global subscriber. */
use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber` fmt layer reading `RUST_LOG` (default
/// `info`), writing to stderr. Safe to call at most once per process; a
/// second call is a silent no-op rather than a panic, since a plugin-style
/// host may load this crate more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
