// Logging setup
//
// Structured logs via tracing. `RUST_LOG` wins when set; otherwise the agent
// logs at info (debug with `verbose`) and quiets its HTTP stack.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{AgentError, Result};

/// Default filter when `RUST_LOG` is unset.
pub fn default_filter(verbose: bool) -> String {
    filter_for_level(if verbose { "debug" } else { "info" })
}

fn filter_for_level(level: &str) -> String {
    format!("overlay_agent={level},hyper=warn,reqwest=warn")
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored (embedding hosts may have installed their own).
pub fn init(verbose: bool) {
    install(default_filter(verbose));
}

/// Like `init`, with an explicit agent log level (`error` .. `trace`, `off`).
/// Used by hosts embedding the agent through the C binding.
pub fn init_with_level(level: &str) -> Result<()> {
    let level = level.trim();
    level
        .parse::<LevelFilter>()
        .map_err(|_| AgentError::InvalidConfig(format!("unknown log level '{}'", level)))?;
    install(filter_for_level(&level.to_ascii_lowercase()));
    Ok(())
}

fn install(fallback: String) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        for verbose in [false, true] {
            assert!(EnvFilter::try_new(default_filter(verbose)).is_ok());
        }
    }

    #[test]
    fn test_level_filters_parse() {
        for level in ["error", "warn", "info", "debug", "trace", "off"] {
            assert!(EnvFilter::try_new(filter_for_level(level)).is_ok());
        }
    }

    #[test]
    fn test_unknown_level_is_invalid_config() {
        assert!(matches!(
            init_with_level("loud"),
            Err(AgentError::InvalidConfig(_))
        ));
        assert!(init_with_level("WARN").is_ok());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init(false);
        init(true);
    }
}
