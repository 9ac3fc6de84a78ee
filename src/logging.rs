use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the logging system
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level filter (e.g., "debug", "info", "warn", "error")
    pub level: String,
    /// Optional log file path. If None, logs only to stderr
    pub file_path: Option<PathBuf>,
    /// Whether to use structured JSON format for logs
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_path: None,
            json_format: false,
        }
    }
}

impl LogConfig {
    /// Create LogConfig from environment variables
    ///
    /// - `RUST_LOG`: level filter
    /// - `CMT_LOG_FILE`: log file path
    /// - `CMT_LOG_UNIQUE=true`: append the process ID to the log file name
    /// - `CMT_LOG_JSON=true`: JSON output
    pub fn from_env() -> Self {
        let level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

        let unique = env::var("CMT_LOG_UNIQUE").unwrap_or_default() == "true";
        let file_path = env::var("CMT_LOG_FILE")
            .ok()
            .map(|path| unique_log_path(PathBuf::from(path), unique));

        let json_format = env::var("CMT_LOG_JSON").unwrap_or_default() == "true";

        Self {
            level,
            file_path,
            json_format,
        }
    }

    /// Override values from CLI arguments
    pub fn with_overrides(mut self, level: Option<String>, file_path: Option<PathBuf>) -> Self {
        if let Some(level) = level {
            self.level = level;
        }
        if let Some(file_path) = file_path {
            self.file_path = Some(file_path);
        }
        self
    }
}

/// Insert the PID before the extension when `unique` is set
fn unique_log_path(mut path_buf: PathBuf, unique: bool) -> PathBuf {
    if !unique {
        return path_buf;
    }
    if let Some(filename) = path_buf.file_stem() {
        let extension = path_buf
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");

        let pid = std::process::id();
        let unique_filename = if extension.is_empty() {
            format!("{}.{}", filename.to_string_lossy(), pid)
        } else {
            format!("{}.{}.{}", filename.to_string_lossy(), pid, extension)
        };

        path_buf.set_file_name(unique_filename);
    }
    path_buf
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match (&config.file_path, config.json_format) {
        (Some(file_path), true) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer().json().with_writer(file).with_ansi(false);

            subscriber.with(file_layer).init();
        }
        (Some(file_path), false) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;

            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);

            subscriber.with(file_layer).init();
        }
        (None, true) => {
            let stderr_layer = fmt::layer().json().with_writer(io::stderr).with_ansi(false);

            subscriber.with(stderr_layer).init();
        }
        (None, false) => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(true)
                .with_target(true);

            subscriber.with(stderr_layer).init();
        }
    }

    Ok(())
}

/// Log a CMake Server protocol message in one structured line
#[macro_export]
macro_rules! log_cms_message {
    ($level:expr, $direction:expr, $kind:expr, $data:expr) => {
        tracing::event!(
            $level,
            direction = $direction,
            kind = $kind,
            data = ?$data,
            pid = std::process::id(),
            "CMake Server message"
        );
    };
}

/// Log the duration of an operation
#[macro_export]
macro_rules! log_timing {
    ($level:expr, $operation:expr, $duration:expr) => {
        tracing::event!(
            $level,
            operation = $operation,
            duration_ms = $duration.as_millis(),
            pid = std::process::id(),
            "Performance timing"
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_log_path() {
        let pid = std::process::id();
        assert_eq!(
            unique_log_path(PathBuf::from("/tmp/cmt.log"), true),
            PathBuf::from(format!("/tmp/cmt.{pid}.log"))
        );
        assert_eq!(
            unique_log_path(PathBuf::from("/tmp/cmt"), true),
            PathBuf::from(format!("/tmp/cmt.{pid}"))
        );
        assert_eq!(
            unique_log_path(PathBuf::from("/tmp/cmt.log"), false),
            PathBuf::from("/tmp/cmt.log")
        );
    }

    #[test]
    fn test_overrides() {
        let config = LogConfig::default()
            .with_overrides(Some("debug".into()), Some(PathBuf::from("/tmp/x.log")));
        assert_eq!(config.level, "debug");
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/x.log")));
    }
}
