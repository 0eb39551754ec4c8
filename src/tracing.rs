use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

/// Default directives when `RUST_LOG` is unset: our crate at `info`, sqlx statement logging
/// kept at `warn` so batch inserts don't flood the output.
pub const DEFAULT_FILTER: &str = "worldbank_etl=info,sqlx=warn,info";

/// Install the global fmt subscriber. `default_filter` applies only when `RUST_LOG` is not set.
pub fn init_tracing(default_filter: &str) -> Result<(), anyhow::Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}
