use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV_VAR: &str = "RIGGER_LOG";

/// Picks the filter directive: `RIGGER_LOG`, then `RUST_LOG`, then `debug` under
/// `--verbose`, otherwise `warn`.
pub fn filter_directive(
    rigger_log: Option<&str>,
    rust_log: Option<&str>,
    verbose: bool,
) -> String {
    for candidate in [rigger_log, rust_log].into_iter().flatten() {
        if !candidate.trim().is_empty() {
            return candidate.trim().to_string();
        }
    }
    if verbose {
        "debug".to_string()
    } else {
        "warn".to_string()
    }
}

/// Installs the stderr subscriber. Output: compact format, never mixed into stdout.
pub fn init(verbose: bool) {
    let directive = filter_directive(
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        verbose,
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
