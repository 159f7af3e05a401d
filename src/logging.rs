//! Tracing subscriber construction.
//!
//! Log destinations follow the `[logs]` configuration section: an optional
//! info log file, an optional error-only log file, and — with verbose mode
//! or when no file is configured — standard output. `RUST_LOG` overrides the
//! default filter.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::Logs;

/// Errors raised while opening log destinations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed creating log file {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber according to the `[logs]` section.
pub fn init(logs: &Logs) -> Result<(), LogError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if logs.verbose { "debug" } else { "info" })
    });

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if !logs.info.is_empty() {
        layers.push(file_layer(&logs.info, logs.no_datetime, None)?);
    }

    if !logs.error.is_empty() {
        layers.push(file_layer(&logs.error, logs.no_datetime, Some(LevelFilter::ERROR))?);
    }

    if logs.verbose || layers.is_empty() {
        let layer = tracing_subscriber::fmt::layer();
        layers.push(if logs.no_datetime {
            layer.without_time().boxed()
        } else {
            layer.boxed()
        });
    }

    tracing_subscriber::registry().with(layers).with(filter).init();

    Ok(())
}

fn file_layer(
    path: &str,
    no_datetime: bool,
    level: Option<LevelFilter>,
) -> Result<BoxedLayer, LogError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(path))
        .map_err(|source| LogError::Open {
            path: path.to_owned(),
            source,
        })?;

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false);

    Ok(match (no_datetime, level) {
        (true, Some(level)) => layer.without_time().with_filter(level).boxed(),
        (true, None) => layer.without_time().boxed(),
        (false, Some(level)) => layer.with_filter(level).boxed(),
        (false, None) => layer.boxed(),
    })
}
