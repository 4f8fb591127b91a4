//! Logging setup.
//!
//! Stdout carries the JSON-RPC stream, so logs always go to stderr.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "pageindex_mcp=debug,pageindex_client=debug,pageindex_tools=debug,pageindex_auth=debug"
    } else {
        "pageindex_mcp=info,pageindex_client=info,pageindex_tools=info,pageindex_auth=info"
    }
}

/// Initialize the global subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        for verbose in [false, true] {
            assert!(EnvFilter::try_new(default_filter(verbose)).is_ok());
        }
        assert!(default_filter(true).contains("pageindex_client=debug"));
    }
}
