//! Log output for the binary
//!
//! Everything in the crate logs through the `log` facade. This installs a
//! `tracing-subscriber` formatter on stderr that also picks up `log` records,
//! filtered by `RUST_LOG` (default `info`).

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        if let Err(e) = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
        {
            eprintln!("Logging already initialized: {}", e);
        }
    });
}
