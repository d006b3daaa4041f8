//! Subscriber setup for hosts embedding the supervisor.

use tracing_subscriber::EnvFilter;

/// Target used for lines forwarded from the hosted instance's stdout/stderr.
pub const OUTPUT_TARGET: &str = "hosted_instance::output";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; only the first call installs anything, and an
/// existing global subscriber is left alone.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            // Instance output is chatty; keep it out of the default dev log.
            EnvFilter::new(format!("debug,{OUTPUT_TARGET}=info"))
        } else {
            EnvFilter::new("info")
        }
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_is_idempotent() {
        super::init();
        super::init();
        tracing::info!("logging initialised twice without panicking");
    }
}
