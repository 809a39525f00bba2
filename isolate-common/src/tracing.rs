use serde::{Deserialize, Serialize};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    pub service_name: String,
    pub default_env_filter: String,
    pub pretty: bool,
    pub with_ansi: bool,
    pub json: bool,
}

impl TracingConfig {
    pub fn local_dev(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_env_filter: "info".to_string(),
            pretty: true,
            with_ansi: true,
            json: false,
        }
    }

    pub fn test(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_env_filter: "debug".to_string(),
            pretty: false,
            with_ansi: false,
            json: false,
        }
    }

    pub fn test_pretty_without_time(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            default_env_filter: "debug".to_string(),
            pretty: true,
            with_ansi: false,
            json: false,
        }
    }
}

/// Initializes the global `tracing` subscriber from `RUST_LOG` if set,
/// falling back to `config.default_env_filter`.
pub fn init_tracing_with_default_env_filter(config: &TracingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_env_filter));

    let fmt_layer = fmt::layer()
        .with_ansi(config.with_ansi)
        .with_target(true);

    let fmt_layer = if config.json {
        fmt_layer.json().boxed()
    } else if config.pretty {
        fmt_layer.pretty().boxed()
    } else {
        fmt_layer.boxed()
    };

    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    if initialized {
        tracing::debug!(service = %config.service_name, "tracing subscriber initialized");
    }
}
