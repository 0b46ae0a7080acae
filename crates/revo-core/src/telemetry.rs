//! Tracing initialisation for the `revo` binary and embedding services.
//!
//! Review events are written to stderr so stdout stays free for the review
//! JSON. Only the first successful [`init_tracing`] call installs anything.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Shape of each log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line events.
    #[default]
    Text,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Filter used when `RUST_LOG` is unset: `level` for the revo crates,
/// warnings only for dependencies.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    format!("warn,revo_core={level},revo={level}")
}

/// Install the global subscriber. Returns `false` when one was already set.
pub fn init_tracing(format: LogFormat, level: Level) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let events = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let events = match format {
        LogFormat::Text => events.boxed(),
        LogFormat::Json => events.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(events)
        .with(filter)
        .try_init()
        .is_ok()
}
