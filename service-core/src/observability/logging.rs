use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the tracing subscriber for a service.
///
/// `RUST_LOG` wins when set; otherwise `log_level` is used as the default
/// directive. Output is JSON-formatted with file/line for correlation with
/// the request-id middleware.
pub fn init_logging(service_name: &str, log_level: &str) {
    let default_directive = format!("{},{}={}", log_level, service_name.replace('-', "_"), "debug");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .json()
                .flatten_event(true),
        )
        .init();
}
