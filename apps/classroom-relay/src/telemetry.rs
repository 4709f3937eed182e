use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install the global subscriber. An unparsable filter falls back to `info` and is
/// reported once the subscriber is live.
pub fn init_tracing(filter: &str) {
    let (env_filter, rejected) = match EnvFilter::try_new(filter) {
        Ok(env_filter) => (env_filter, None),
        Err(err) => (EnvFilter::new("info"), Some(err)),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
    if let Some(err) = rejected {
        tracing::warn!(%filter, error = %err, "invalid log filter; falling back to info");
    }
}
