use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "trialguard=info";

fn subscriber(filter: EnvFilter) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .finish()
}

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG`.
///
/// Embedding shells that already installed a subscriber keep theirs; the
/// return value says whether this call installed one.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    subscriber(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn test_default_filter_keeps_crate_info() {
        let scoped = subscriber(EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing::subscriber::with_default(scoped, || {
            assert!(tracing::enabled!(target: "trialguard::licensing::sync", Level::INFO));
            assert!(!tracing::enabled!(target: "trialguard::licensing::sync", Level::DEBUG));
            assert!(!tracing::enabled!(target: "reqwest::connect", Level::INFO));
        });
    }
}
