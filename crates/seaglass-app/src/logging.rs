//! Log subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`, defaulting to `info`.
pub fn init_logging() -> bool {
    init_logging_with("info")
}

/// Install a formatting subscriber, using `default_filter` when `RUST_LOG` is unset.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging_with(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_refused() {
        init_logging_with("warn");
        assert!(!init_logging());
    }
}
