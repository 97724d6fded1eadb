use crate::config::Environment;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber: pretty output for development, JSON
/// for production.
///
/// `RUST_LOG` overrides the default filter. Without it, development enables
/// engine-level debug (frame routing, command execution) while production
/// stays at `info`.
pub fn setup_logging(environment: Environment) {
    let default_filter = match environment {
        Environment::Production => "info",
        Environment::Development => "info,capture=debug",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match environment {
        Environment::Production => {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_level(true))
                .init();
        }
        Environment::Development => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
                .init();
        }
    }
}
