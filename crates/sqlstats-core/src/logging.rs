//! Tracing subscriber setup for the `sqlstats` binary.
//!
//! Events use the fields `node_id`, `schedule_id`, `schedule_name`, `job_id`
//! and `table` wherever they apply.

pub use crate::config::LogFormat;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// Where and how the binary writes its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Default filter; `RUST_LOG` replaces it when set.
    pub level: String,
    pub format: LogFormat,
    /// Appended to in addition to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info.as_str().to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("{0}")]
    Level(String),

    #[error("failed to open log file {}: {source}", path.display())]
    OpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("a global log subscriber is already installed")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Severity accepted by `general.log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level '{s}' (expected trace, debug, info, warn or error)"
            )),
        }
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_append(path: &Path) -> Result<File, LogError> {
    let open = || -> io::Result<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    };
    open().map_err(|source| LogError::OpenFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Install the global subscriber: stderr, plus the log file when one is
/// configured.
///
/// The level and the file are checked before anything global is touched.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let level: LogLevel = config.level.parse().map_err(LogError::Level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let mut layers = vec![output_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        let file = open_append(path)?;
        layers.push(output_layer(config.format, Mutex::new(file), false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()?;

    tracing::debug!(
        log_level = level.as_str(),
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_leniently() {
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!(" INFO ".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::Error.as_str(), "error");
        assert!("loud".parse::<LogLevel>().unwrap_err().contains("loud"));
    }

    #[test]
    fn bad_level_is_rejected_before_install() {
        let config = LogConfig {
            level: "verbose".to_string(),
            ..LogConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(LogError::Level(_))));
    }

    #[test]
    fn unopenable_file_is_reported_with_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let config = LogConfig {
            file: Some(blocker.join("sqlstats.log")),
            ..LogConfig::default()
        };

        let err = init_logging(&config).unwrap_err();
        assert!(matches!(err, LogError::OpenFile { .. }), "{err}");
        assert!(err.to_string().contains("not-a-dir"));
    }

    #[test]
    fn second_install_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: "warn".to_string(),
            format: LogFormat::Json,
            file: Some(dir.path().join("logs").join("sqlstats.log")),
        };
        // Tests share one process; only the second call's result is certain.
        let _ = init_logging(&config);
        assert!(matches!(
            init_logging(&config),
            Err(LogError::AlreadyInstalled(_))
        ));
        assert!(dir.path().join("logs").join("sqlstats.log").exists());
    }
}
