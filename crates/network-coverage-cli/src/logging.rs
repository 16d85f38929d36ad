use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber
///
/// When `RUST_LOG` is not set a default filter is used instead.
pub fn setup_logging() {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let default = if cfg!(debug_assertions) {
                "info,network_coverage_lib=debug"
            } else {
                "info"
            };
            EnvFilter::new(default)
        }
    };

    let registered = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
    if let Err(e) = registered {
        eprintln!("Logging already initialised: {e}");
    }
}
