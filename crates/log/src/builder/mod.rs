//! Logger builder implementation

use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::Layered, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::{Config, Format};
use crate::core::{LogError, LogResult};

/// Logger builder
#[derive(Debug)]
pub struct LoggerBuilder {
    config: Config,
}

/// Applies the shared display toggles, then installs with or without a timer.
macro_rules! install_fmt_layer {
    ($filter:expr, $layer:expr, $display:expr) => {{
        let display = $display;
        let layer = $layer
            .with_ansi(display.colors)
            .with_target(display.target)
            .with_file(display.source)
            .with_line_number(display.source);
        if display.time {
            install($filter, layer)
        } else {
            install($filter, layer.without_time())
        }
    }};
}

impl LoggerBuilder {
    /// Create builder from config
    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Parse the filter without installing anything.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Filter`] when the level directive is malformed.
    pub fn filter(&self) -> LogResult<EnvFilter> {
        EnvFilter::try_new(&self.config.level)
            .map_err(|e| LogError::Filter(format!("{}: {e}", self.config.level)))
    }

    /// Build and install the global subscriber
    ///
    /// # Errors
    ///
    /// Returns error if the filter cannot be parsed or a global subscriber
    /// is already installed.
    pub fn build(self) -> LogResult<()> {
        let filter = self.filter()?;
        let display = &self.config.display;

        match self.config.format {
            Format::Pretty => install_fmt_layer!(filter, fmt::layer().pretty(), display),
            Format::Compact => install_fmt_layer!(filter, fmt::layer().compact(), display),
            Format::Json => install_fmt_layer!(
                filter,
                fmt::layer().json().flatten_event(true).with_current_span(true),
                display
            ),
        }
    }
}

fn install<L>(filter: EnvFilter, layer: L) -> LogResult<()>
where
    L: Layer<Layered<EnvFilter, Registry>> + Send + Sync + 'static,
{
    Registry::default()
        .with(filter)
        .with(layer)
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))
}
