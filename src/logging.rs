// Structured logging setup for the CLI

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "media_downloader=info";

/// Install the global subscriber. Logs go to stderr so `--json` output on
/// stdout stays machine-readable.
///
/// `verbose` raises the default filter to debug; `RUST_LOG` wins over both.
pub fn init_subscriber(json: bool, verbose: bool) -> Result<(), tracing_subscriber::util::TryInitError> {
    let default = if verbose {
        "media_downloader=debug"
    } else {
        DEFAULT_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    }
}
