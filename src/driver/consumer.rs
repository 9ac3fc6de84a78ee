//! Output consumers for cmake and build-tool output

use regex::Regex;
use std::sync::{Arc, LazyLock, Mutex};
use tracing::{info, warn};

use crate::io::OutputConsumer;

static MAKE_PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\s*(\d{1,3})%\]").expect("valid regex"));

static NINJA_PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(\d+)/(\d+)\]").expect("valid regex"));

/// Forwards every line to the log
#[derive(Debug, Clone)]
pub struct LoggingConsumer {
    source: String,
}

impl LoggingConsumer {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl OutputConsumer for LoggingConsumer {
    fn output(&self, line: &str) {
        info!(target: "cmake_output", "[{}] {}", self.source, line);
    }

    fn error(&self, line: &str) {
        warn!(target: "cmake_output", "[{}] {}", self.source, line);
    }
}

/// Percentage reported by a build tool progress prefix
///
/// Makefile generators print `[ 42%]`, Ninja prints `[3/17]`.
pub fn parse_progress(line: &str) -> Option<u32> {
    if let Some(caps) = MAKE_PROGRESS_RE.captures(line) {
        return caps[1].parse::<u32>().ok().map(|p| p.min(100));
    }
    let caps = NINJA_PROGRESS_RE.captures(line)?;
    let done: u64 = caps[1].parse().ok()?;
    let total: u64 = caps[2].parse().ok()?;
    if total == 0 {
        return None;
    }
    Some((done.checked_mul(100)? / total).min(100) as u32)
}

pub type BuildProgressCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Passes lines on to another consumer and reports progress changes
pub struct BuildOutputConsumer {
    inner: Arc<dyn OutputConsumer>,
    on_progress: Option<BuildProgressCallback>,
    last_progress: Mutex<Option<u32>>,
}

impl BuildOutputConsumer {
    pub fn new(inner: Arc<dyn OutputConsumer>, on_progress: Option<BuildProgressCallback>) -> Self {
        Self {
            inner,
            on_progress,
            last_progress: Mutex::new(None),
        }
    }

    pub fn last_progress(&self) -> Option<u32> {
        self.last_progress.lock().ok().and_then(|p| *p)
    }
}

impl OutputConsumer for BuildOutputConsumer {
    fn output(&self, line: &str) {
        if let Some(percent) = parse_progress(line) {
            let changed = match self.last_progress.lock() {
                Ok(mut last) => {
                    let changed = *last != Some(percent);
                    *last = Some(percent);
                    changed
                }
                Err(_) => false,
            };
            if changed {
                if let Some(on_progress) = &self.on_progress {
                    on_progress(percent);
                }
            }
        }
        self.inner.output(line);
    }

    fn error(&self, line: &str) {
        self.inner.error(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CollectingConsumer;

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("[ 42%] Building CXX object foo.o"), Some(42));
        assert_eq!(parse_progress("[100%] Linking CXX executable app"), Some(100));
        assert_eq!(parse_progress("[3/4] Building CXX object a.o"), Some(75));
        assert_eq!(parse_progress("[0/0] nothing"), None);
        assert_eq!(parse_progress("warning: [ 10%] not a prefix"), None);
        assert_eq!(parse_progress("make: Nothing to be done"), None);
        assert_eq!(parse_progress("[999999999999999999/1] x"), None);
        assert_eq!(parse_progress("[99999999999999999/1] x"), Some(100));
    }

    #[test]
    fn test_build_consumer_reports_changes_only() {
        let collect = Arc::new(CollectingConsumer::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let consumer = BuildOutputConsumer::new(
            collect.clone(),
            Some(Arc::new(move |p: u32| seen_clone.lock().unwrap().push(p))),
        );

        for line in ["[ 10%] a", "[ 10%] b", "plain", "[ 50%] c", "[100%] d"] {
            consumer.output(line);
        }
        consumer.error("ld: warning");

        assert_eq!(*seen.lock().unwrap(), vec![10, 50, 100]);
        assert_eq!(consumer.last_progress(), Some(100));
        assert_eq!(collect.output_lines().len(), 5);
        assert_eq!(collect.error_lines(), vec!["ld: warning"]);
    }
}
