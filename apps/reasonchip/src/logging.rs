//! Logging initialization from config and `--log-level` flags.

use reasonchip_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Build the filter and install the subscriber once. Flag directives come
/// after config directives so they win for the same target.
pub fn init(config: &LoggingConfig, flags: &[String]) {
    let mut directives = config.directives();
    directives.extend(flags.iter().cloned());

    let filter = if directives.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_new(directives.join(",")).unwrap_or_else(|err| {
            eprintln!("warning: invalid log directives ({err}); falling back to 'info'");
            EnvFilter::new("info")
        })
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
