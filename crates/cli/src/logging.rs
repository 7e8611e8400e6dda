//! Console logging
//!
//! Everything goes to stderr: stdout is the protocol channel.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set
fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "warn,storepull=debug,storepull_core=debug,storepull_transport=debug"
    } else {
        "warn"
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbose`.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
