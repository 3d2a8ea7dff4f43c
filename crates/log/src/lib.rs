//! # Bulwark Log
//!
//! `tracing-subscriber` setup shared by bulwark binaries, demos and tests.
//!
//! ```no_run
//! // BULWARK_LOG=debug BULWARK_LOG_FORMAT=json
//! bulwark_log::auto_init().ok();
//! tracing::info!("ready");
//! ```

pub mod builder;
pub mod config;
pub mod core;

pub use builder::LoggerBuilder;
pub use config::{Config, DisplayConfig, Format};
pub use crate::core::{LogError, LogResult};

/// Install a global subscriber from `config`.
///
/// # Errors
///
/// Fails on an invalid filter or when a subscriber is already installed.
pub fn init(config: Config) -> LogResult<()> {
    LoggerBuilder::from_config(config).build()
}

/// Install a global subscriber configured from the environment.
///
/// # Errors
///
/// See [`init`].
pub fn auto_init() -> LogResult<()> {
    init(Config::from_env())
}

/// Route logs through the test harness's captured output.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test() {
    let level = std::env::var("BULWARK_LOG").unwrap_or_else(|_| Config::test().level);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .with_test_writer()
        .without_time()
        .compact()
        .try_init();
}
