use std::fmt;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Compact => f.write_str("compact"),
            Self::Json => f.write_str("json"),
        }
    }
}

/// Logging section of the controller options, flattened into [`Options`].
///
/// The filter itself comes from `RUST_LOG` (defaulting to `info`).
///
/// [`Options`]: crate::options::Options
#[derive(Clone, Copy, Debug, Default, Parser)]
pub struct Config {
    /// Output format for log lines.
    #[clap(
        long,
        env = "BLOCKHOST_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Full
    )]
    pub log_format: LogFormat,
}

impl Config {
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self.log_format {
            LogFormat::Full => builder.init(),
            LogFormat::Compact => builder.compact().init(),
            LogFormat::Json => builder.json().init(),
        }
    }
}
